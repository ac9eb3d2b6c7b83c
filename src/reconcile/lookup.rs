//! Exact-match lookup
//!
//! List endpoints filter by substring; data sources need exactly one record.

use crate::error::{Error, Result};
use serde_json::Value;

/// Return the unique item matching `predicate`.
///
/// `what` names the collection and `key` the search value, both quoted in errors.
pub fn find_exact<T, I, P>(items: I, what: &str, key: &str, predicate: P) -> Result<T>
where
    I: IntoIterator<Item = T>,
    P: Fn(&T) -> bool,
{
    let mut matches: Vec<T> = items.into_iter().filter(|item| predicate(item)).collect();
    match matches.len() {
        0 => Err(Error::NotFound(format!("{} with {:?}", what, key))),
        1 => Ok(matches.remove(0)),
        count => Err(Error::TooManyResults {
            what: what.to_string(),
            key: key.to_string(),
            count,
        }),
    }
}

/// Unique JSON object whose `field` equals `value`
pub fn find_by_field(items: Vec<Value>, what: &str, field: &str, value: &str) -> Result<Value> {
    find_exact(items, what, value, |item| {
        item.get(field).and_then(|v| v.as_str()) == Some(value)
    })
}

/// Unique JSON object named `name`
pub fn find_by_name(items: Vec<Value>, what: &str, name: &str) -> Result<Value> {
    find_by_field(items, what, "name", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn records() -> Vec<Value> {
        vec![json!({"name": "a"}), json!({"name": "b"}), json!({"name": "a"})]
    }

    #[test]
    fn test_unique_match() {
        let found = find_by_name(records(), "records", "b").unwrap();
        assert_eq!(found["name"], "b");
    }

    #[test]
    fn test_no_match_names_key() {
        let err = find_by_name(records(), "records", "c").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("\"c\""));
    }

    #[test]
    fn test_ambiguous_match_reports_count() {
        let err = find_by_name(records(), "records", "a").unwrap_err();
        match err {
            Error::TooManyResults { count, key, .. } => {
                assert_eq!(count, 2);
                assert_eq!(key, "a");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_substring_is_not_a_match() {
        let items = vec![json!({"name": "dup-1"}), json!({"name": "dup"})];
        assert_eq!(find_by_name(items, "records", "dup").unwrap()["name"], "dup");
    }
}
