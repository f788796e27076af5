//! Property filters
//!
//! Filters are written as `key=v1,v2`. A resource matches when every filter
//! matches (AND), and a filter matches when the property equals any of its
//! values (OR). The value `-` stands for "absent or empty".

use crate::error::{Error, Result};
use crate::resource::selector::{ResourceIdentifier, SEPARATOR};

/// Value matching a missing or cleared property
pub const UNSET: &str = "-";

/// Anything that exposes string properties by key
pub trait PropertyBag {
    fn property(&self, key: &str) -> Option<&str>;
}

/// One compiled `key=values` filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpression {
    pub key: String,
    pub values: Vec<String>,
}

impl FilterExpression {
    pub fn new(key: impl Into<String>, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Parse a single `key=v1,v2` term
    pub fn parse(term: &str) -> Result<Self> {
        let (key, values) = term
            .split_once('=')
            .ok_or_else(|| Error::InvalidInput(format!("filter '{}' has no '='", term)))?;

        if key.is_empty() {
            return Err(Error::InvalidInput(format!("filter '{}' has an empty key", term)));
        }

        let values: Vec<String> = values.split(',').map(String::from).collect();
        if values.iter().any(String::is_empty) {
            return Err(Error::InvalidInput(format!(
                "filter '{}' has an empty value",
                term
            )));
        }

        Ok(Self {
            key: key.to_string(),
            values,
        })
    }

    pub fn matches<B: PropertyBag + ?Sized>(&self, bag: &B) -> bool {
        let actual = bag.property(&self.key);
        self.values.iter().any(|wanted| match actual {
            _ if wanted == UNSET => actual.is_none_or(str::is_empty),
            Some(value) => value == wanted,
            None => false,
        })
    }
}

/// Compile user filter terms
///
/// A term without `=` selects by name. A name containing the source
/// separator also pins the source.
pub fn compile<S: AsRef<str>>(terms: &[S]) -> Result<Vec<FilterExpression>> {
    let mut filters = Vec::with_capacity(terms.len());

    for term in terms {
        let term = term.as_ref();
        if term.contains('=') {
            filters.push(FilterExpression::parse(term)?);
        } else if term.contains(SEPARATOR) {
            let id = ResourceIdentifier::parse(term)?;
            filters.push(FilterExpression {
                key: "name".into(),
                values: vec![id.name],
            });
            if let Some(source) = id.source {
                filters.push(FilterExpression {
                    key: "source".into(),
                    values: vec![source],
                });
            }
        } else {
            filters.push(FilterExpression::parse(&format!("name={}", term))?);
        }
    }

    Ok(filters)
}

/// AND across all filters
pub fn matches_all<B: PropertyBag + ?Sized>(bag: &B, filters: &[FilterExpression]) -> bool {
    filters.iter().all(|f| f.matches(bag))
}

/// Keep the candidates every filter accepts, preserving order
pub fn select<T: PropertyBag>(candidates: Vec<T>, filters: &[FilterExpression]) -> Vec<T> {
    candidates
        .into_iter()
        .filter(|c| matches_all(c, filters))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Bag(HashMap<&'static str, &'static str>);

    impl PropertyBag for Bag {
        fn property(&self, key: &str) -> Option<&str> {
            self.0.get(key).copied()
        }
    }

    fn bag(pairs: &[(&'static str, &'static str)]) -> Bag {
        Bag(pairs.iter().copied().collect())
    }

    #[test]
    fn test_not_template_filter() {
        let filter = FilterExpression::parse("template=no,-").unwrap();
        assert!(filter.matches(&bag(&[("name", "web")])));
        assert!(filter.matches(&bag(&[("template", "no")])));
        assert!(filter.matches(&bag(&[("template", "")])));
        assert!(!filter.matches(&bag(&[("template", "yes")])));
    }

    #[test]
    fn test_sentinel_is_not_a_real_value() {
        let filter = FilterExpression::parse("template=-").unwrap();
        assert!(!filter.matches(&bag(&[("template", "-x")])));
        assert!(!filter.matches(&bag(&[("template", "no")])));
    }

    #[test]
    fn test_and_across_filters() {
        let filters = compile(&["boot=on", "priority=10,20"]).unwrap();
        assert!(matches_all(&bag(&[("boot", "on"), ("priority", "20")]), &filters));
        assert!(!matches_all(&bag(&[("boot", "off"), ("priority", "20")]), &filters));
        assert!(!matches_all(&bag(&[("boot", "on")]), &filters));
    }

    #[test]
    fn test_bare_term_is_name_filter() {
        let filters = compile(&["web"]).unwrap();
        assert_eq!(filters, vec![FilterExpression::new("name", &["web"])]);

        let filters = compile(&["tank/web"]).unwrap();
        assert_eq!(
            filters,
            vec![
                FilterExpression::new("name", &["web"]),
                FilterExpression::new("source", &["tank"]),
            ]
        );
    }

    #[test]
    fn test_invalid_terms() {
        assert!(matches!(compile(&["=yes"]), Err(Error::InvalidInput(_))));
        assert!(matches!(compile(&["template="]), Err(Error::InvalidInput(_))));
        assert!(matches!(compile(&["a,,b"]), Err(Error::InvalidInput(_))));
        assert!(compile(&["bad/na me"]).is_err());
    }

    #[test]
    fn test_select_preserves_order() {
        let filters = compile(&["template=no,-"]).unwrap();
        let kept = select(
            vec![
                bag(&[("name", "a")]),
                bag(&[("name", "b"), ("template", "yes")]),
                bag(&[("name", "c"), ("template", "no")]),
            ],
            &filters,
        );
        let names: Vec<_> = kept.iter().map(|b| b.property("name").unwrap()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }
}
