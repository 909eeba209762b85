//! Request descriptors and bucket key derivation.

use serde::{Deserialize, Serialize};

/// A single observed request attribute, such as `path` or `user_id`.
///
/// Descriptors are also used as match predicates inside rules, where a value
/// of `*` matches any request value for the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub key: String,
    pub value: String,
}

impl Descriptor {
    /// Value used in rule predicates to match any request value.
    pub const WILDCARD: &'static str = "*";

    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Build a descriptor whose value may be missing.
    ///
    /// A missing value is stored as the empty string, which key derivation
    /// treats as "attribute absent".
    pub fn optional(key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        Self {
            key: key.into(),
            value: value.map(Into::into).unwrap_or_default(),
        }
    }

    /// Whether the request actually carried a value for this key.
    pub fn is_present(&self) -> bool {
        !self.value.is_empty()
    }

    /// Whether this rule predicate is satisfied by a request descriptor.
    pub fn matches(&self, observed: &Descriptor) -> bool {
        self.key == observed.key && (self.value == Self::WILDCARD || self.value == observed.value)
    }
}

/// A key that uniquely identifies one rate-limited entity.
///
/// The key is composed of the matched rule's domain and every non-empty
/// request descriptor, sorted by key and value so that the same attributes
/// always produce the same key regardless of enumeration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    /// The domain of the rule that governs this bucket
    pub domain: String,
    /// Non-empty key-value pairs observed on the request
    pub entries: Vec<(String, String)>,
}

impl BucketKey {
    /// Create a key from explicit parts, e.g. for administrative lookups.
    pub fn new<K, V>(domain: &str, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            domain: domain.to_string(),
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Derive the key for a request governed by a rule in `domain`.
    pub fn derive(domain: &str, descriptors: &[Descriptor]) -> Self {
        let mut entries: Vec<(String, String)> = descriptors
            .iter()
            .filter(|d| d.is_present())
            .map(|d| (d.key.clone(), d.value.clone()))
            .collect();
        entries.sort();

        Self {
            domain: domain.to_string(),
            entries,
        }
    }

    /// Convert the key to its string form, `domain:k1=v1:k2=v2`.
    pub fn to_string_key(&self) -> String {
        let mut key = self.domain.clone();
        for (k, v) in &self.entries {
            key.push(':');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
