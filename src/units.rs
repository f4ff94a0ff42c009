//! Integer token amounts in smallest units and conversion to/from decimal
//! display strings.

/// An amount of tokens expressed in the token's smallest unit.
pub type TokenAmount = u128;

/// Largest number of decimals representable by a [TokenAmount].
pub const MAX_DECIMALS: u8 = 38;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitsError {
    #[error("{0} decimals exceeds the maximum of {MAX_DECIMALS}")]
    TooManyDecimals(u8),
    #[error("{0:?} is not a decimal amount")]
    Malformed(String),
    #[error("{0:?} has more than {1} fractional digits")]
    TooPrecise(String, u8),
    #[error("{0:?} does not fit in a token amount")]
    Overflow(String),
}

/// Returns `10^decimals`.
pub fn unit_scale(decimals: u8) -> Result<TokenAmount, UnitsError> {
    if decimals > MAX_DECIMALS {
        return Err(UnitsError::TooManyDecimals(decimals));
    }

    Ok(10u128.pow(decimals as u32))
}

/// Converts a decimal display amount such as `"1000"` or `"12.5"` into
/// smallest units with the given number of decimals.
///
/// ```
/// use score_rewards::units::parse_units;
///
/// assert_eq!(parse_units("12.5", 2).unwrap(), 1250);
/// ```
pub fn parse_units(amount: &str, decimals: u8) -> Result<TokenAmount, UnitsError> {
    let scale = unit_scale(decimals)?;
    let malformed = || UnitsError::Malformed(amount.to_owned());
    let overflow = || UnitsError::Overflow(amount.to_owned());

    let amount_trimmed = amount.trim();
    let (whole, frac) = match amount_trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount_trimmed, ""),
    };

    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && frac.is_empty())
        || !all_digits(whole)
        || !all_digits(frac)
    {
        return Err(malformed());
    }

    let frac = frac.trim_end_matches('0');
    if frac.len() > decimals as usize {
        return Err(UnitsError::TooPrecise(amount.to_owned(), decimals));
    }

    let whole: TokenAmount = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };

    let frac_units: TokenAmount = if frac.is_empty() {
        0
    } else {
        let padding = 10u128.pow((decimals as usize - frac.len()) as u32);
        frac.parse::<TokenAmount>().map_err(|_| malformed())? * padding
    };

    whole
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(overflow)
}

/// Formats an amount of smallest units as a decimal display string, dropping
/// trailing fractional zeros.
pub fn format_units(amount: TokenAmount, decimals: u8) -> String {
    let decimals = decimals.min(MAX_DECIMALS);
    let scale = 10u128.pow(decimals as u32);
    let whole = amount / scale;
    let frac = amount % scale;

    if frac == 0 {
        return whole.to_string();
    }

    let frac = format!("{:0width$}", frac, width = decimals as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Computes `floor(x * y / d)` exactly, without requiring `x * y` to fit in a
/// [TokenAmount]. Returns `None` if `d` is zero or the result overflows.
pub fn mul_div_floor(x: u128, y: u128, d: u128) -> Option<u128> {
    let (floor, _) = mul_div(x, y, d)?;
    Some(floor)
}

/// Computes `ceil(x * y / d)` exactly. Returns `None` if `d` is zero or the
/// result overflows.
pub fn mul_div_ceil(x: u128, y: u128, d: u128) -> Option<u128> {
    let (floor, exact) = mul_div(x, y, d)?;
    if exact {
        Some(floor)
    } else {
        floor.checked_add(1)
    }
}

/// Splits `y = q*d + r` so that `x*y/d = x*q + x*r/d`. For `x <= d` only
/// `x*r` can overflow, and only once `d` exceeds `2^64`.
fn mul_div(x: u128, y: u128, d: u128) -> Option<(u128, bool)> {
    if d == 0 {
        return None;
    }

    let q = y / d;
    let r = y % d;
    let xr = x.checked_mul(r)?;
    let floor = x.checked_mul(q)?.checked_add(xr / d)?;

    Some((floor, xr % d == 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_whole_and_fractional() {
        assert_eq!(parse_units("1000", 0).unwrap(), 1000);
        assert_eq!(parse_units("1000", 18).unwrap(), 1000 * 10u128.pow(18));
        assert_eq!(parse_units("0.5", 18).unwrap(), 5 * 10u128.pow(17));
        assert_eq!(parse_units(".25", 2).unwrap(), 25);
        assert_eq!(parse_units("3.10", 1).unwrap(), 31);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(parse_units("", 2), Err(UnitsError::Malformed(_))));
        assert!(matches!(parse_units(".", 2), Err(UnitsError::Malformed(_))));
        assert!(matches!(parse_units("-1", 2), Err(UnitsError::Malformed(_))));
        assert!(matches!(parse_units("1e3", 2), Err(UnitsError::Malformed(_))));
        assert!(matches!(
            parse_units("0.001", 2),
            Err(UnitsError::TooPrecise(_, 2))
        ));
        assert_eq!(parse_units("1", 39), Err(UnitsError::TooManyDecimals(39)));
        assert!(matches!(
            parse_units("1000000000000000000000", 38),
            Err(UnitsError::Overflow(_))
        ));
    }

    #[test]
    fn format_drops_trailing_zeros() {
        assert_eq!(format_units(1250, 2), "12.5");
        assert_eq!(format_units(1200, 2), "12");
        assert_eq!(format_units(5, 3), "0.005");
        assert_eq!(format_units(0, 18), "0");
    }

    #[test]
    fn mul_div_matches_naive_when_small() {
        for (x, y, d) in [(1, 10, 3), (100, 1000, 1000), (7, 13, 5), (0, 9, 4)]
        {
            assert_eq!(mul_div_floor(x, y, d), Some(x * y / d));
            assert_eq!(mul_div_ceil(x, y, d), Some((x * y + d - 1) / d));
        }
    }

    #[test]
    fn mul_div_handles_wide_products() {
        // 1e21 * u64::MAX overflows u128 naively.
        let pool = 1000 * 10u128.pow(18);
        let score = u64::MAX as u128;
        assert_eq!(mul_div_floor(score, pool, score), Some(pool));

        let score = 3 * 10u128.pow(18);
        assert_eq!(mul_div_floor(score, pool, 4 * score), Some(pool / 4));
    }

    #[test]
    fn mul_div_zero_divisor() {
        assert_eq!(mul_div_floor(1, 1, 0), None);
        assert_eq!(mul_div_ceil(1, 1, 0), None);
    }
}
