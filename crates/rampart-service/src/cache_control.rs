//! TTL extraction from upstream `Cache-Control` headers.

/// Returns the freshness lifetime in seconds granted by a `Cache-Control`
/// value.
///
/// `no-cache` and `private` short-circuit to 0, even when a max-age is
/// also present. `s-maxage` strictly overrides `max-age`. Anything else,
/// including an unparseable value, yields 0 (not cacheable).
pub fn ttl_seconds(value: &str) -> u32 {
    let value = value.to_ascii_lowercase();

    if value.contains("no-cache") || value.contains("private") {
        return 0;
    }

    digits_after(&value, "s-maxage=")
        .or_else(|| digits_after(&value, "max-age="))
        .unwrap_or(0)
}

/// Parses the decimal run following `needle`, saturating at `u32::MAX`.
fn digits_after(haystack: &str, needle: &str) -> Option<u32> {
    let start = haystack.find(needle)? + needle.len();
    let digits: &str = haystack[start..]
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("");
    if digits.is_empty() {
        return None;
    }

    let mut seconds: u32 = 0;
    for b in digits.bytes() {
        seconds = seconds
            .saturating_mul(10)
            .saturating_add(u32::from(b - b'0'));
    }
    Some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_age() {
        assert_eq!(ttl_seconds("max-age=300"), 300);
        assert_eq!(ttl_seconds("public, max-age=60"), 60);
        assert_eq!(ttl_seconds("MAX-AGE=5"), 5);
    }

    #[test]
    fn test_s_maxage_overrides_max_age() {
        assert_eq!(ttl_seconds("max-age=60, s-maxage=600"), 600);
        assert_eq!(ttl_seconds("s-maxage=600, max-age=60"), 600);
    }

    #[test]
    fn test_uncacheable_directives_short_circuit() {
        assert_eq!(ttl_seconds("no-cache"), 0);
        assert_eq!(ttl_seconds("private, max-age=300"), 0);
        // no-cache wins even over an explicit s-maxage
        assert_eq!(ttl_seconds("no-cache, s-maxage=60"), 0);
    }

    #[test]
    fn test_no_directive_means_zero() {
        assert_eq!(ttl_seconds(""), 0);
        assert_eq!(ttl_seconds("public"), 0);
        assert_eq!(ttl_seconds("must-revalidate"), 0);
        assert_eq!(ttl_seconds("max-age="), 0);
    }

    #[test]
    fn test_numeric_edge_cases() {
        assert_eq!(ttl_seconds("max-age=007"), 7);
        assert_eq!(ttl_seconds("max-age=99999999999999999999"), u32::MAX);
    }
}
