use serde::Serialize;
use serde_json::Value;

/// A validated model answer: exactly one SQL statement plus a human-readable summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedGenerationResult {
    pub query: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Response must be a JSON object with string 'query' and 'summary' fields")]
    MissingFields,
    #[error("Multiple SQL statements detected at position {0}. Only one statement is allowed.")]
    MultipleStatements(usize),
}

/// Byte offset of the first `;` outside a single-quoted literal.
///
/// Quote state flips on every `'`, so a doubled `''` escape leaves the scan inside the literal.
pub fn find_unquoted_separator(query: &str) -> Option<usize> {
    let mut in_string = false;
    for (idx, c) in query.char_indices() {
        match c {
            '\'' => in_string = !in_string,
            ';' if !in_string => return Some(idx),
            _ => {}
        }
    }
    None
}

pub fn parse_generation_response(response: &str) -> Result<ParsedGenerationResult, ValidationError> {
    let parsed: Value = serde_json::from_str(response.trim())
        .map_err(|e| ValidationError::InvalidJson(e.to_string()))?;

    let (Some(query), Some(summary)) = (
        parsed.get("query").and_then(Value::as_str),
        parsed.get("summary").and_then(Value::as_str),
    ) else {
        return Err(ValidationError::MissingFields);
    };

    if let Some(pos) = find_unquoted_separator(query) {
        return Err(ValidationError::MultipleStatements(pos));
    }

    Ok(ParsedGenerationResult {
        query: query.trim().to_string(),
        summary: summary.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parses_query_and_summary() {
        let parsed = parse_generation_response(
            r#"{"query": "SELECT name FROM users WHERE note = 'a;b'", "summary": "Lists users"}"#,
        )
        .unwrap();
        assert_eq!(parsed.query, "SELECT name FROM users WHERE note = 'a;b'");
        assert_eq!(parsed.summary, "Lists users");
    }

    #[test]
    fn test_rejects_non_json() {
        let err = parse_generation_response("Sure! Here is the query: SELECT 1").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidJson(_)));
    }

    #[test]
    fn test_rejects_missing_or_non_string_fields() {
        assert_eq!(
            parse_generation_response(r#"{"query": "SELECT 1"}"#),
            Err(ValidationError::MissingFields)
        );
        assert_eq!(
            parse_generation_response(r#"{"query": 1, "summary": "x"}"#),
            Err(ValidationError::MissingFields)
        );
        assert_eq!(
            parse_generation_response(r#"["SELECT 1", "x"]"#),
            Err(ValidationError::MissingFields)
        );
    }

    #[test]
    fn test_rejects_multiple_statements() {
        let err = parse_generation_response(
            r#"{"query": "DELETE FROM order_items; DELETE FROM orders", "summary": "x"}"#,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::MultipleStatements(23));
    }

    #[test]
    fn test_trailing_separator_is_rejected() {
        assert_eq!(find_unquoted_separator("SELECT 1;"), Some(8));
    }

    #[test]
    fn test_doubled_quote_escape_stays_inside_literal() {
        assert_eq!(find_unquoted_separator("SELECT 'it''s; fine'"), None);
        assert_eq!(find_unquoted_separator("SELECT 'it''s'; DROP TABLE t"), Some(14));
    }

    fn quoted_literal() -> impl Strategy<Value = String> {
        "[a-z ;]{0,8}".prop_map(|body| format!("'{}'", body))
    }

    fn bare_segment() -> impl Strategy<Value = String> {
        "[A-Za-z0-9 =(),*]{0,10}"
    }

    fn statement() -> impl Strategy<Value = String> {
        prop::collection::vec((bare_segment(), quoted_literal()), 0..5).prop_map(|parts| {
            parts
                .into_iter()
                .map(|(bare, quoted)| format!("{}{}", bare, quoted))
                .collect::<String>()
        })
    }

    proptest! {
        #[test]
        fn prop_separators_inside_literals_are_ignored(sql in statement()) {
            prop_assert_eq!(find_unquoted_separator(&sql), None);
        }

        #[test]
        fn prop_separator_outside_literals_is_found(
            head in statement(),
            tail in statement(),
        ) {
            let sql = format!("{};{}", head, tail);
            prop_assert_eq!(find_unquoted_separator(&sql), Some(head.len()));
        }
    }
}
