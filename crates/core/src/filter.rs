//! URL filters deciding which requests are in-domain, and request fingerprints.

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// A configured URL filter rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub id: i64,
    /// Exact host names this rule applies to.
    pub hosts: Vec<String>,
    /// Drop the query string when fingerprinting a matching URL.
    pub exclude_query_params: bool,
    /// Optional regular expression the URL path must match.
    pub path_pattern: Option<String>,
    /// Optional credentials reference handed to the fetcher (e.g. a cookies file).
    pub credentials_ref: Option<String>,
}

impl Filter {
    /// Normalized fingerprint of a URL under this rule, used as the dedup key.
    pub fn fingerprint(&self, url: &Url) -> String {
        let mut url = url.clone();
        if self.exclude_query_params {
            url.set_query(None);
        }
        url.to_string()
    }
}

/// Join hosts into the newline-separated storage form.
pub fn join_hosts(hosts: &[String]) -> String {
    hosts.join("\n")
}

/// Split the newline-separated storage form, dropping blank lines.
pub fn split_hosts(hosts: &str) -> Vec<String> {
    hosts
        .split('\n')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// A request URL resolved against a filter.
#[derive(Clone, Debug)]
pub struct FilterMatch<'a> {
    pub filter: &'a Filter,
    pub fingerprint: String,
}

/// An ordered set of compiled filter rules.
#[derive(Clone, Debug, Default)]
pub struct FilterSet {
    rules: Vec<(Filter, Option<Regex>)>,
}

impl FilterSet {
    /// Compile a set of filters. Invalid path patterns are rejected.
    pub fn new(filters: Vec<Filter>) -> crate::Result<Self> {
        let mut rules = Vec::with_capacity(filters.len());
        for filter in filters {
            let pattern = match filter.path_pattern.as_deref().map(str::trim) {
                Some(p) if !p.is_empty() => Some(Regex::new(p).map_err(|e| {
                    crate::Error::InvalidFilter(format!(
                        "filter {} has invalid path pattern '{p}': {e}",
                        filter.id
                    ))
                })?),
                _ => None,
            };
            rules.push((filter, pattern));
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve a URL to at most one rule.
    ///
    /// The first rule listing the URL's host decides: if it carries a path
    /// pattern that does not match, the URL is out of domain.
    pub fn resolve(&self, url: &Url) -> Option<&Filter> {
        let host = url.host_str()?;
        let (filter, pattern) = self
            .rules
            .iter()
            .find(|(filter, _)| filter.hosts.iter().any(|h| h == host))?;
        match pattern {
            Some(re) if !re.is_match(url.path()) => None,
            _ => Some(filter),
        }
    }

    /// Parse and resolve raw message text, producing the dedup fingerprint.
    pub fn match_text(&self, text: &str) -> Option<FilterMatch<'_>> {
        let url = Url::parse(text.trim()).ok()?;
        let filter = self.resolve(&url)?;
        Some(FilterMatch {
            filter,
            fingerprint: filter.fingerprint(&url),
        })
    }
}
