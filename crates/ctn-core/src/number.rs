//! Size arguments: an unsigned integer with an optional power-of-1024 unit.

use ctn_error::{CtnError, Result};

/// Parse `arg` as a C-style integer (`0x` hex, leading-`0` octal, decimal)
/// followed by at most one unit letter: `b` (bytes), `k`, `m`, `g`, `t`,
/// `p` (case-insensitive).
///
/// `u64::MAX` is reserved as the overflow sentinel and rejected, as is any
/// value that overflows once the unit is applied.
pub fn parse_number(arg: &str) -> Result<u64> {
    let invalid = || CtnError::InvalidNumber(arg.to_owned());

    let text = arg.trim_start();
    let bytes = text.as_bytes();
    let (radix, body) = match bytes {
        [b'0', b'x' | b'X', next, ..] if next.is_ascii_hexdigit() => (16, &text[2..]),
        [b'0', ..] => (8, text),
        _ => (10, text),
    };

    let end = body
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(body.len());
    if end == 0 {
        return Err(invalid());
    }
    let value = u64::from_str_radix(&body[..end], radix).map_err(|_| invalid())?;
    if value == u64::MAX {
        return Err(invalid());
    }

    let mut suffix = body[end..].chars();
    let shift = match (suffix.next(), suffix.next()) {
        (None, _) => 0,
        (Some(unit), None) => match unit.to_ascii_lowercase() {
            'b' => 0,
            'k' => 10,
            'm' => 20,
            'g' => 30,
            't' => 40,
            'p' => 50,
            _ => return Err(invalid()),
        },
        _ => return Err(invalid()),
    };

    value.checked_mul(1_u64 << shift).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn plain_and_suffixed_values() {
        assert_eq!(parse_number("10").expect("10"), 10);
        assert_eq!(parse_number("4K").expect("4K"), 4096);
        assert_eq!(parse_number("4k").expect("4k"), 4096);
        assert_eq!(parse_number("1M").expect("1M"), 1_048_576);
        assert_eq!(parse_number("2g").expect("2g"), 2 << 30);
        assert_eq!(parse_number("3T").expect("3T"), 3 << 40);
        assert_eq!(parse_number("1p").expect("1p"), 1 << 50);
        assert_eq!(parse_number("512b").expect("512b"), 512);
    }

    #[test]
    fn c_style_radix_prefixes() {
        assert_eq!(parse_number("0x10").expect("hex"), 16);
        assert_eq!(parse_number("010").expect("octal"), 8);
        assert_eq!(parse_number("0").expect("zero"), 0);
        assert_eq!(parse_number("0x1k").expect("hex with unit"), 1024);
    }

    #[test]
    fn garbage_is_rejected() {
        for arg in ["abc", "", "k", "10x", "4kb", "08", "0xg", "-1", " "] {
            assert!(
                matches!(parse_number(arg), Err(CtnError::InvalidNumber(ref s)) if s == arg),
                "{arg:?} should be invalid"
            );
        }
    }

    #[test]
    fn sentinel_and_overflow_are_rejected() {
        assert!(parse_number("18446744073709551615").is_err());
        assert!(parse_number("18446744073709551616").is_err());
        assert!(parse_number("16384p").is_err());
        assert_eq!(parse_number("16383p").expect("fits"), 16383 << 50);
    }

    proptest! {
        #[test]
        fn kilo_suffix_scales_by_1024(n in 0_u64..(u64::MAX >> 10)) {
            prop_assert_eq!(parse_number(&format!("{n}k")).expect("k"), n * 1024);
            prop_assert_eq!(parse_number(&format!("{n}K")).expect("K"), n * 1024);
        }
    }
}
