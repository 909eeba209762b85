//! Cross-domain rule resolution.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::descriptor::Descriptor;
use super::rules::{Rule, RuleCatalog};

/// Ordered list of domains consulted when resolving a request's rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainPriority(Vec<String>);

impl DomainPriority {
    pub fn new<S: Into<String>>(domains: impl IntoIterator<Item = S>) -> Self {
        Self(domains.into_iter().map(Into::into).collect())
    }

    pub fn domains(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for DomainPriority {
    fn default() -> Self {
        Self::new(["endpoint", "auth", "user", "ip", "messaging", "api"])
    }
}

/// Finds the single rule governing a request.
///
/// Domains are consulted in priority order and the first domain with a
/// matching rule wins. No match in any domain means the request is not
/// rate limited.
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    catalog: Arc<RuleCatalog>,
}

impl RuleMatcher {
    pub fn new(catalog: Arc<RuleCatalog>) -> Self {
        Self { catalog }
    }

    /// Resolve the governing rule for `request` across `priority`.
    pub fn resolve(&self, priority: &DomainPriority, request: &[Descriptor]) -> Option<&Rule> {
        priority
            .iter()
            .find_map(|domain| self.catalog.find_matching_rule(domain, request))
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::{RateLimit, TimeUnit};

    fn catalog() -> Arc<RuleCatalog> {
        Arc::new(RuleCatalog::new(vec![
            Rule::new(
                "api",
                vec![Descriptor::new("path", "*")],
                RateLimit::new(TimeUnit::Minute, 100).unwrap(),
            ),
            Rule::new(
                "auth",
                vec![Descriptor::new("auth_type", "login")],
                RateLimit::new(TimeUnit::Minute, 5).unwrap(),
            ),
        ]))
    }

    #[test]
    fn test_priority_order_selects_domain() {
        let matcher = RuleMatcher::new(catalog());
        let request = vec![
            Descriptor::new("path", "/api/auth/login"),
            Descriptor::new("auth_type", "login"),
        ];

        let rule = matcher
            .resolve(&DomainPriority::new(["auth", "api"]), &request)
            .unwrap();
        assert_eq!(rule.domain, "auth");

        let rule = matcher
            .resolve(&DomainPriority::new(["api", "auth"]), &request)
            .unwrap();
        assert_eq!(rule.domain, "api");
    }

    #[test]
    fn test_falls_through_to_later_domain() {
        let matcher = RuleMatcher::new(catalog());
        let request = vec![Descriptor::new("path", "/api/data")];

        let rule = matcher.resolve(&DomainPriority::default(), &request).unwrap();
        assert_eq!(rule.domain, "api");
    }

    #[test]
    fn test_no_match_anywhere() {
        let matcher = RuleMatcher::new(catalog());
        let request = vec![Descriptor::new("method", "GET")];

        assert!(matcher.resolve(&DomainPriority::default(), &request).is_none());
    }

    #[test]
    fn test_domains_outside_priority_are_ignored() {
        let matcher = RuleMatcher::new(catalog());
        let request = vec![Descriptor::new("path", "/api/data")];

        assert!(matcher
            .resolve(&DomainPriority::new(["auth", "user"]), &request)
            .is_none());
    }

    #[test]
    fn test_default_priority() {
        let priority = DomainPriority::default();
        assert_eq!(
            priority.domains(),
            ["endpoint", "auth", "user", "ip", "messaging", "api"]
        );
    }
}
