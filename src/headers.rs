//! Header allow-lists
//!
//! An allow-list keeps only the named headers of a request or response.
//! Matching is case-insensitive. An empty list applies no filtering at all.

use hyper::header::{HeaderMap, HeaderName};

/// Case-insensitive set of header names to keep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderAllowList {
    names: Vec<String>,
}

impl HeaderAllowList {
    /// Build an allow-list, copying the given names
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// True when no filtering is applied
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether a header name survives filtering
    pub fn allows(&self, name: &str) -> bool {
        self.is_empty() || self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    /// Remove every header not on the list. Returns the number of names removed.
    pub fn retain(&self, headers: &mut HeaderMap) -> usize {
        if self.is_empty() {
            return 0;
        }

        let dropped: Vec<HeaderName> = headers
            .keys()
            .filter(|name| !self.allows(name.as_str()))
            .cloned()
            .collect();

        for name in &dropped {
            headers.remove(name);
        }

        dropped.len()
    }
}
