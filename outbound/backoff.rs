// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The exponential backoff schedule for outbound task retries (§4.F):
//! 5, 20, 45, 120, 300 minutes for attempts 1..5, clamped at 300 minutes
//! for every attempt beyond that.

use jiff::SignedDuration;

const SCHEDULE_MINUTES: [i64; 5] = [5, 20, 45, 120, 300];

/// The backoff delay for the Nth failed attempt (1-indexed). `attempt <= 0`
/// is treated as attempt 1.
pub fn backoff_for(attempt: i32) -> SignedDuration {
    let attempt = attempt.max(1) as usize;
    let minutes = SCHEDULE_MINUTES
        .get(attempt - 1)
        .copied()
        .unwrap_or(*SCHEDULE_MINUTES.last().unwrap());
    SignedDuration::from_mins(minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_published_schedule() {
        assert_eq!(backoff_for(1), SignedDuration::from_mins(5));
        assert_eq!(backoff_for(2), SignedDuration::from_mins(20));
        assert_eq!(backoff_for(3), SignedDuration::from_mins(45));
        assert_eq!(backoff_for(4), SignedDuration::from_mins(120));
        assert_eq!(backoff_for(5), SignedDuration::from_mins(300));
    }

    #[test]
    fn clamps_at_300_minutes_beyond_the_table() {
        assert_eq!(backoff_for(10), SignedDuration::from_mins(300));
        assert_eq!(backoff_for(100), SignedDuration::from_mins(300));
    }

    #[test]
    fn non_positive_attempts_use_the_first_entry() {
        assert_eq!(backoff_for(0), SignedDuration::from_mins(5));
        assert_eq!(backoff_for(-3), SignedDuration::from_mins(5));
    }
}
