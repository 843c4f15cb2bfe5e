use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one cache line.
///
/// Keys are derived from a resource type and a scope, e.g. `products_acme`,
/// `product_42_acme` or `config_acme`. Comparison is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from a resource type and its scope: `{resource}_{scope}`.
    pub fn new(resource: &str, scope: &str) -> Self {
        CacheKey(format!("{}_{}", resource, scope))
    }

    /// Product listing of a store.
    pub fn products(subdomain: &str) -> Self {
        Self::new("products", subdomain)
    }

    /// A single product of a store.
    pub fn product(id: impl fmt::Display, subdomain: &str) -> Self {
        CacheKey(format!("product_{}_{}", id, subdomain))
    }

    /// Store configuration.
    pub fn config(subdomain: &str) -> Self {
        Self::new("config", subdomain)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        CacheKey(raw.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        CacheKey(raw)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_keys() {
        assert_eq!(CacheKey::products("acme").as_str(), "products_acme");
        assert_eq!(CacheKey::product(42, "acme").as_str(), "product_42_acme");
        assert_eq!(CacheKey::config("acme").as_str(), "config_acme");
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        assert_ne!(CacheKey::products("Acme"), CacheKey::products("acme"));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let json = serde_json::to_string(&CacheKey::config("acme")).unwrap();
        assert_eq!(json, "\"config_acme\"");
    }
}
