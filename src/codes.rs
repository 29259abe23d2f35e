//! Response-code pattern matching.
//!
//! Patterns are comma-separated lists of elements, each one of:
//! - an exact code: `200`
//! - an inclusive range: `300-399`
//! - a status class: `2XX` (matches `200..=299`)
//!
//! An empty pattern matches every code. Elements that fail to parse never
//! match, but they don't stop the remaining elements from being checked.

use std::ops::RangeInclusive;
use std::sync::OnceLock;

use regex::Regex;

/// Check whether `code` satisfies `pattern`.
pub fn match_code(code: u32, pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return true;
    }

    pattern
        .split(',')
        .filter_map(parse_element)
        .any(|range| range.contains(&code))
}

/// Check that every element of `pattern` parses.
///
/// Used by configuration validation; nothing is evaluated.
pub fn is_valid_code_pattern(pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return true;
    }

    pattern.split(',').all(|element| parse_element(element).is_some())
}

fn parse_element(element: &str) -> Option<RangeInclusive<u32>> {
    let element = element.trim();
    if element.is_empty() {
        return None;
    }

    static CLASS: OnceLock<Regex> = OnceLock::new();
    let class = CLASS.get_or_init(|| Regex::new(r"^(?P<digit>[1-9])[xX]{2}$").unwrap());

    if let Some(caps) = class.captures(element) {
        let digit: u32 = caps["digit"].parse().ok()?;
        return Some(digit * 100..=digit * 100 + 99);
    }

    if let Some((low, high)) = element.split_once('-') {
        let low: u32 = low.trim().parse().ok()?;
        let high: u32 = high.trim().parse().ok()?;
        if low > high {
            return None;
        }
        return Some(low..=high);
    }

    let exact: u32 = element.parse().ok()?;
    Some(exact..=exact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_range() {
        assert!(match_code(301, "200,300-399"));
        assert!(!match_code(250, "200,300-399"));
        assert!(match_code(200, "200,300-399"));
        assert!(match_code(399, "200,300-399"));
    }

    #[test]
    fn test_empty_pattern_matches_everything() {
        assert!(match_code(200, ""));
        assert!(match_code(0, "   "));
        assert!(match_code(599, ""));
    }

    #[test]
    fn test_status_class() {
        assert!(match_code(204, "2XX"));
        assert!(match_code(299, "2xx"));
        assert!(!match_code(300, "2XX"));
        assert!(match_code(404, "2XX,4XX"));
        assert!(!match_code(500, "0XX"));
    }

    #[test]
    fn test_malformed_elements_do_not_poison_siblings() {
        assert!(match_code(200, "abc,200"));
        assert!(match_code(301, "399-300, 301"));
        assert!(!match_code(200, "abc"));
        assert!(!match_code(350, "399-300"));
        assert!(match_code(3, " 1 , 3 "));
    }

    #[test]
    fn test_pattern_validation() {
        assert!(is_valid_code_pattern(""));
        assert!(is_valid_code_pattern("200"));
        assert!(is_valid_code_pattern("200,301-302"));
        assert!(is_valid_code_pattern("2XX, 404"));
        assert!(!is_valid_code_pattern("200,"));
        assert!(!is_valid_code_pattern("20X"));
        assert!(!is_valid_code_pattern("302-301"));
        assert!(!is_valid_code_pattern("ok"));
    }
}
