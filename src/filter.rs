//! Tag selectors to inventory filter criteria.

use std::collections::HashMap;
use std::ops::Index;

use serde::Serialize;

use crate::error::FilterError;

/// One inventory filter: a tag key and the values it may take.
///
/// Values are OR'ed; criteria with different keys are AND'ed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Criterion {
    key: String,
    values: Vec<String>,
}

impl Criterion {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Filter name in the form cloud inventories expect, e.g. `tag:env`.
    pub fn filter_name(&self) -> String {
        format!("tag:{}", self.key)
    }

    pub fn matches(&self, tags: &HashMap<String, String>) -> bool {
        tags.get(&self.key)
            .is_some_and(|value| self.values.iter().any(|v| v == value))
    }
}

/// Ordered criteria, one per distinct key in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Criteria(Vec<Criterion>);

impl Criteria {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when a host carrying `tags` satisfies every criterion.
    pub fn matches(&self, tags: &HashMap<String, String>) -> bool {
        self.0.iter().all(|criterion| criterion.matches(tags))
    }
}

impl Index<usize> for Criteria {
    type Output = Criterion;

    fn index(&self, index: usize) -> &Criterion {
        &self.0[index]
    }
}

/// Builds inventory criteria from `KEY:VALUE` tag selectors.
///
/// Each tag is split on its first `:`. The first tag without a separator, or
/// with an empty key or value, aborts the build; no partial criteria are
/// returned. Repeated keys collect their values into a single criterion.
pub fn build_filter<S: AsRef<str>>(tags: &[S]) -> Result<Criteria, FilterError> {
    let mut criteria: Vec<Criterion> = Vec::new();

    for tag in tags {
        let raw = tag.as_ref();
        let (key, value) = match raw.split_once(':') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => (key, value),
            _ => return Err(FilterError::new(raw)),
        };

        match criteria.iter_mut().find(|criterion| criterion.key == key) {
            Some(criterion) => {
                if !criterion.values.iter().any(|v| v == value) {
                    criterion.values.push(value.to_string());
                }
            }
            None => criteria.push(Criterion {
                key: key.to_string(),
                values: vec![value.to_string()],
            }),
        }
    }

    Ok(Criteria(criteria))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_build_filter() {
        let filter = build_filter(&["machinetype:varnish", "env:stage"]).unwrap();
        assert_eq!(filter.len(), 2);
        assert_eq!(filter[0].key(), "machinetype");
        assert_eq!(filter[0].values(), ["varnish"]);
        assert_eq!(filter[0].filter_name(), "tag:machinetype");
        assert_eq!(filter[1].key(), "env");
        assert_eq!(filter[1].values(), ["stage"]);
        assert_eq!(filter[1].filter_name(), "tag:env");
    }

    #[test]
    fn test_build_filter_invalid() {
        let err = build_filter(&["machinetypevarnish", "env:stage"]).unwrap_err();
        assert_eq!(err.to_string(), "expected TAG:VALUE got machinetypevarnish");
        assert_eq!(err.raw(), "machinetypevarnish");
    }

    #[test]
    fn test_build_filter_stops_at_first_invalid() {
        let err = build_filter(&["env:stage", "bad", "alsobad"]).unwrap_err();
        assert_eq!(err.raw(), "bad");
    }

    #[test]
    fn test_build_filter_rejects_empty_parts() {
        assert_eq!(build_filter(&[":varnish"]).unwrap_err().raw(), ":varnish");
        assert_eq!(build_filter(&["env:"]).unwrap_err().raw(), "env:");
    }

    #[test]
    fn test_build_filter_groups_repeated_keys() {
        let filter =
            build_filter(&["env:stage", "role:cache", "env:prod", "env:stage"]).unwrap();
        assert_eq!(filter.len(), 2);
        assert_eq!(filter[0].key(), "env");
        assert_eq!(filter[0].values(), ["stage", "prod"]);
        assert_eq!(filter[1].key(), "role");
        assert_eq!(filter[1].values(), ["cache"]);
    }

    #[test]
    fn test_build_filter_splits_on_first_separator() {
        let filter = build_filter(&["url:http://cache"]).unwrap();
        assert_eq!(filter[0].key(), "url");
        assert_eq!(filter[0].values(), ["http://cache"]);
    }

    #[test]
    fn test_build_filter_is_idempotent() {
        let input = vec!["machinetype:varnish".to_string(), "env:stage".to_string()];
        assert_eq!(build_filter(&input).unwrap(), build_filter(&input).unwrap());
    }

    #[test]
    fn test_build_filter_empty_input() {
        let filter = build_filter::<&str>(&[]).unwrap();
        assert!(filter.is_empty());
        assert!(filter.matches(&tags(&[("env", "stage")])));
    }

    #[test]
    fn test_criteria_matches() {
        let filter = build_filter(&["env:stage", "env:prod", "machinetype:varnish"]).unwrap();

        assert!(filter.matches(&tags(&[("env", "prod"), ("machinetype", "varnish")])));
        assert!(filter.matches(&tags(&[
            ("env", "stage"),
            ("machinetype", "varnish"),
            ("team", "web"),
        ])));
        assert!(!filter.matches(&tags(&[("env", "dev"), ("machinetype", "varnish")])));
        assert!(!filter.matches(&tags(&[("env", "stage")])));
    }
}
