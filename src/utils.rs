/// Human-readable count, e.g. `15.19M`.
pub fn format_count(n: usize) -> String {
    const UNITS: [(f64, &str); 3] = [(1e9, "B"), (1e6, "M"), (1e3, "K")];
    let value = n as f64;
    for (scale, suffix) in UNITS {
        if value >= scale {
            return format!("{:.2}{suffix}", value / scale);
        }
    }
    n.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(15_191_712), "15.19M");
        assert_eq!(format_count(2_500), "2.50K");
        assert_eq!(format_count(7_000_000_000), "7.00B");
    }
}
