//! Query key definitions.
//!
//! A [`QueryKey`] is an ordered sequence of string segments identifying one
//! cached resource. Keys form a prefix hierarchy: invalidating a shorter key
//! invalidates every key sharing that prefix. The [`namespace`] module holds
//! the well-known keys of the dashboard domain, which are the contract
//! between presentation panels and the cache.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hierarchical identifier for one cached resource.
///
/// Two keys are equal iff their segment sequences are equal element-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    /// Build a key from its segments.
    ///
    /// Panics on an empty key or empty segment: a malformed key is a
    /// caller-side programming error and must fail at call time rather than
    /// silently caching under a broken identity.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        assert!(!segments.is_empty(), "a query key needs at least one segment");
        assert!(
            segments.iter().all(|segment| !segment.is_empty()),
            "query key segments must be non-empty"
        );
        Self(segments)
    }

    /// Single-segment key.
    pub fn root(segment: impl Into<String>) -> Self {
        Self::new([segment.into()])
    }

    /// This key extended by one more segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self::new(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether `prefix` is an element-wise prefix of this key.
    ///
    /// Every key is a prefix of itself.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Which cache entries an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScope {
    /// Exactly one key.
    Exact(QueryKey),
    /// Every key sharing the given prefix, the prefix itself included.
    Prefix(QueryKey),
    /// Every entry in the store.
    All,
}

impl KeyScope {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::Exact(exact) => key == exact,
            Self::Prefix(prefix) => key.starts_with(prefix),
            Self::All => true,
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(key) => write!(f, "{key}"),
            Self::Prefix(prefix) => write!(f, "{prefix}/*"),
            Self::All => write!(f, "*"),
        }
    }
}

/// Well-known keys of the dashboard domain.
///
/// Panels address the cache exclusively through these constructors; the
/// segment spellings are load-bearing and must not change.
pub mod namespace {
    use super::QueryKey;

    pub fn bancos() -> QueryKey {
        QueryKey::root("bancos")
    }

    pub fn ventas() -> QueryKey {
        QueryKey::root("ventas")
    }

    pub fn ventas_stats() -> QueryKey {
        ventas().child("stats")
    }

    pub fn clientes() -> QueryKey {
        QueryKey::root("clientes")
    }

    pub fn distribuidores() -> QueryKey {
        QueryKey::root("distribuidores")
    }

    pub fn productos() -> QueryKey {
        QueryKey::root("productos")
    }

    pub fn ordenes_compra() -> QueryKey {
        QueryKey::root("ordenes_compra")
    }

    pub fn movimientos() -> QueryKey {
        QueryKey::root("movimientos")
    }

    pub fn movimientos_por_banco(banco_id: &str) -> QueryKey {
        movimientos().child(banco_id)
    }

    pub fn kpis() -> QueryKey {
        QueryKey::root("kpis")
    }

    pub fn dashboard() -> QueryKey {
        QueryKey::root("dashboard")
    }

    /// Keys whose cached values are derived from `resource` and should be
    /// invalidated together with it after a write.
    ///
    /// Aggregate views (`kpis`, `dashboard`) depend on every resource;
    /// `ventas` additionally feeds its own stats view and `bancos` feeds the
    /// per-bank movement lists.
    pub fn related_keys(resource: &QueryKey) -> Vec<QueryKey> {
        let mut related = vec![resource.clone()];
        let mut push = |key: QueryKey| {
            if !related.contains(&key) {
                related.push(key);
            }
        };

        match resource.segments().first().map(String::as_str) {
            Some("ventas") => push(ventas_stats()),
            Some("bancos") => push(movimientos()),
            _ => {}
        }
        push(kpis());
        push(dashboard());

        related
    }
}
