//! Routing predicates: compiled JSONPath expressions evaluated against
//! message documents.
//!
//! A module declares which messages it wants via path expressions
//! (`$.address`, `$.order.items[*]`, ...). The only question the router
//! ever asks is "does this expression select at least one node?", so the
//! whole evaluator surface is [`PathExpr::matches`].

use serde_json::Value;
use serde_json_path::JsonPath;

/// A compiled routing predicate.
///
/// Compilation happens once (at module registration); evaluation is pure
/// and never fails. A document the expression cannot descend into (wrong
/// shape, missing fields, not even an object) simply selects nothing and
/// reports no match.
#[derive(Debug, Clone)]
pub struct PathExpr {
    raw: String,
    compiled: JsonPath,
}

impl PathExpr {
    /// Compiles a JSONPath expression.
    ///
    /// # Errors
    ///
    /// Returns the underlying parse error for expressions that are not
    /// valid JSONPath (callers decide whether that is fatal; the registry
    /// treats such predicates as never-matching).
    pub fn parse(expr: &str) -> Result<Self, serde_json_path::ParseError> {
        let compiled = JsonPath::parse(expr)?;
        Ok(Self {
            raw: expr.to_string(),
            compiled,
        })
    }

    /// Returns `true` iff the expression selects at least one node of `doc`.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        !self.compiled.query(doc).is_empty()
    }

    /// The original expression text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn matches_when_field_present() {
        let expr = PathExpr::parse("$.address").unwrap();
        assert!(expr.matches(&json!({ "address": "x" })));
    }

    #[test]
    fn does_not_match_when_field_absent() {
        let expr = PathExpr::parse("$.address").unwrap();
        assert!(!expr.matches(&json!({})));
    }

    #[test]
    fn does_not_match_non_object_documents() {
        let expr = PathExpr::parse("$.address").unwrap();
        assert!(!expr.matches(&json!(null)));
        assert!(!expr.matches(&json!(42)));
        assert!(!expr.matches(&json!("address")));
        assert!(!expr.matches(&json!([1, 2, 3])));
    }

    #[test]
    fn nested_path_selects_deep_nodes() {
        let expr = PathExpr::parse("$.venue.location.lat").unwrap();
        assert!(expr.matches(&json!({ "venue": { "location": { "lat": 1.0 } } })));
        assert!(!expr.matches(&json!({ "venue": { "location": {} } })));
    }

    #[test]
    fn wildcard_matches_any_array_element() {
        let expr = PathExpr::parse("$.items[*].sku").unwrap();
        assert!(expr.matches(&json!({ "items": [{ "sku": "a" }] })));
        assert!(!expr.matches(&json!({ "items": [] })));
    }

    #[test]
    fn null_valued_field_still_matches() {
        // Selection is about node existence, not truthiness.
        let expr = PathExpr::parse("$.address").unwrap();
        assert!(expr.matches(&json!({ "address": null })));
    }

    #[test]
    fn invalid_expression_is_a_parse_error() {
        assert!(PathExpr::parse("address").is_err());
        assert!(PathExpr::parse("$[").is_err());
    }

    #[test]
    fn as_str_returns_original_expression() {
        let expr = PathExpr::parse("$.a.b").unwrap();
        assert_eq!(expr.as_str(), "$.a.b");
    }
}
