// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Deterministic interval selection for the "highlight reel" preview: how
//! many marks a clip of a given duration gets, and where they fall.

use jiff::SignedDuration;

/// Boundary tolerance: a clip just under the 8-hour threshold still gets
/// the 8-hour band's 5 marks, rather than flapping between bands for
/// clips a few minutes shy of it.
const BAND_TOLERANCE: SignedDuration = SignedDuration::from_mins(5);

const PREVIEW_SLICE: SignedDuration = SignedDuration::from_secs(5);

/// Returns `(offset, slice_duration)` pairs, in order, for the preview
/// marks of a clip `duration` long.
pub fn preview_intervals(duration: SignedDuration) -> Vec<(SignedDuration, SignedDuration)> {
    let eight_hours = SignedDuration::from_hours(8);
    let thirty_seconds = SignedDuration::from_secs(30);

    let marks: i64 = if duration + BAND_TOLERANCE >= eight_hours {
        5
    } else if duration >= thirty_seconds {
        3
    } else {
        1
    };

    if marks == 1 {
        return vec![(SignedDuration::ZERO, duration.min(PREVIEW_SLICE))];
    }

    let spacing_secs = if marks == 5 {
        90 * 60 // 1.5h marks, the 8h band's fixed cadence
    } else {
        duration.as_secs() / marks
    };

    (0..marks)
        .map(|i| {
            let offset = SignedDuration::from_secs(spacing_secs * i);
            (offset, PREVIEW_SLICE.min(duration.saturating_sub(offset)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_clip_gets_one_mark_at_start() {
        let marks = preview_intervals(SignedDuration::from_secs(20));
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].0, SignedDuration::ZERO);
    }

    #[test]
    fn mid_clip_gets_three_evenly_spaced_marks() {
        let marks = preview_intervals(SignedDuration::from_mins(30));
        assert_eq!(marks.len(), 3);
        assert_eq!(marks[0].0, SignedDuration::ZERO);
        assert_eq!(marks[1].0, SignedDuration::from_mins(10));
        assert_eq!(marks[2].0, SignedDuration::from_mins(20));
    }

    #[test]
    fn long_clip_gets_five_marks_ninety_minutes_apart() {
        let marks = preview_intervals(SignedDuration::from_hours(8));
        assert_eq!(marks.len(), 5);
        assert_eq!(marks[1].0, SignedDuration::from_mins(90));
        assert_eq!(marks[4].0, SignedDuration::from_mins(90 * 4));
    }

    #[test]
    fn boundary_tolerance_pulls_a_near_eight_hour_clip_into_the_five_mark_band() {
        let marks = preview_intervals(SignedDuration::from_hours(8) - SignedDuration::from_mins(3));
        assert_eq!(marks.len(), 5);
    }
}
