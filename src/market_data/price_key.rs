/// Canonical footprint key for a price.
///
/// Renders with 8 fractional digits, then strips trailing zeros and a
/// trailing decimal point, so `100.00000000`, `100.0` and `100.000000001`
/// all map to `"100"`. Prices are always positive in this domain.
pub fn price_key(price: f64) -> String {
    let rendered = format!("{price:.8}");
    rendered
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_prices_drop_the_fraction() {
        assert_eq!(price_key(100.0), "100");
        assert_eq!(price_key(100.000_000_00), "100");
        assert_eq!(price_key(96_000.000_000_001), "96000");
        assert_eq!(price_key(96_000.000_000_1), "96000.0000001");
    }

    #[test]
    fn fractional_prices_keep_significant_digits() {
        assert_eq!(price_key(37_020.5), "37020.5");
        assert_eq!(price_key(0.000_123_4), "0.0001234");
        assert_eq!(price_key(1.234_567_89), "1.23456789");
    }

    #[test]
    fn float_noise_collapses_to_one_key() {
        let a = 0.1 + 0.2;
        let b = 0.3;
        assert_ne!(a, b);
        assert_eq!(price_key(a), price_key(b));
    }

    #[test]
    fn interior_zeros_are_kept() {
        assert_eq!(price_key(100.05), "100.05");
        assert_eq!(price_key(1_000.0), "1000");
    }
}
