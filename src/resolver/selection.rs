/// Split a comma-separated preset list, dropping blanks and keeping order
#[must_use]
pub fn parse_selection(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selection() {
        assert_eq!(parse_selection("a,b,c"), vec!["a", "b", "c"]);
        assert_eq!(parse_selection(" a , b "), vec!["a", "b"]);
        assert_eq!(parse_selection("a,,b,"), vec!["a", "b"]);
        assert!(parse_selection("").is_empty());
        assert!(parse_selection(" , ").is_empty());
    }

    #[test]
    fn test_parse_selection_keeps_order_and_duplicates() {
        // Duplicates are collapsed by the resolver, not here
        assert_eq!(parse_selection("b,a,b"), vec!["b", "a", "b"]);
    }
}
