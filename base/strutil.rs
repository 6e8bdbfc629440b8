//! Small string helpers shared by the CLI and logging call sites.

use std::fmt::Write as _;

static MULTIPLIERS: [(char, u64); 4] = [
    // (suffix character, power of 2)
    ('T', 40),
    ('G', 30),
    ('M', 20),
    ('K', 10),
];

/// Encodes a non-negative byte count into human-readable form, e.g.
/// `encode_size(1_500_000_000)` -> `"1G 430M 364K 544"`.
pub fn encode_size(mut raw: i64) -> String {
    let mut encoded = String::new();
    for &(c, n) in &MULTIPLIERS {
        if raw >= 1i64 << n {
            write!(&mut encoded, "{}{} ", raw >> n, c).unwrap();
            raw &= (1i64 << n) - 1;
        }
    }
    if raw > 0 || encoded.is_empty() {
        write!(&mut encoded, "{raw}").unwrap();
    } else {
        encoded.pop(); // remove trailing space.
    }
    encoded
}

/// Parses a `decode_size`-compatible string (`"100G"`, `"1.5T"`, `"2048"`)
/// into a byte count. Used for config values like `minimum_free_space_gb`
/// when supplied as a human string rather than a bare integer.
pub fn decode_size(encoded: &str) -> Result<i64, ()> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(());
    }
    let (num_part, mult) = match encoded.chars().last() {
        Some('T') | Some('t') => (&encoded[..encoded.len() - 1], 1i64 << 40),
        Some('G') | Some('g') => (&encoded[..encoded.len() - 1], 1i64 << 30),
        Some('M') | Some('m') => (&encoded[..encoded.len() - 1], 1i64 << 20),
        Some('K') | Some('k') => (&encoded[..encoded.len() - 1], 1i64 << 10),
        _ => (encoded, 1i64),
    };
    let num: f64 = num_part.trim().parse().map_err(|_| ())?;
    if num < 0.0 {
        return Err(());
    }
    Ok((num * mult as f64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_size_round_numbers() {
        assert_eq!(encode_size(0), "0");
        assert_eq!(encode_size(1 << 30), "1G");
        assert_eq!(encode_size((1 << 30) + (1 << 20)), "1G 1M");
    }

    #[test]
    fn decode_size_suffixes() {
        assert_eq!(decode_size("100G").unwrap(), 100 * (1i64 << 30));
        assert_eq!(decode_size("1.5G").unwrap(), (1.5 * (1i64 << 30) as f64) as i64);
        assert_eq!(decode_size("2048").unwrap(), 2048);
        assert!(decode_size("").is_err());
        assert!(decode_size("-5G").is_err());
    }
}
