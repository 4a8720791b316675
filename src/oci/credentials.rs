//! Credential resolution for the registry client.
//!
//! Mirrors the shape of the teacher's auth lookup (try a per-registry entry,
//! fall back to anonymous) without the filesystem-config-file machinery:
//! this system is handed credentials by its caller (CLI flags or
//! environment) rather than reading `~/.docker/config.json` itself.
use std::collections::HashMap;

/// Basic-auth credentials scoped to one registry host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Resolves credentials for a `(registry, scope)` pair. `scope` is the
/// bearer-token scope string (e.g. `repository:library/alpine:pull`) in
/// case a future provider wants to narrow by repository.
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, registry: &str, scope: &str) -> Option<Credentials>;
}

/// Never supplies credentials; registries that require auth will still get
/// a token via the anonymous bearer-token flow where the registry allows it
/// (e.g. Docker Hub's read-only pull tokens).
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousCredentialProvider;

impl CredentialProvider for AnonymousCredentialProvider {
    fn resolve(&self, _registry: &str, _scope: &str) -> Option<Credentials> {
        None
    }
}

/// Fixed per-registry-host credential table, keyed by registry hostname.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialProvider {
    by_registry: HashMap<String, Credentials>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self {
            by_registry: HashMap::new(),
        }
    }

    pub fn with(mut self, registry: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.by_registry.insert(
            registry.into(),
            Credentials {
                username: username.into(),
                password: password.into(),
            },
        );
        self
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn resolve(&self, registry: &str, _scope: &str) -> Option<Credentials> {
        self.by_registry.get(registry).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_never_resolves() {
        let p = AnonymousCredentialProvider;
        assert!(p.resolve("registry-1.docker.io", "repository:x:pull").is_none());
    }

    #[test]
    fn static_resolves_only_known_registries() {
        let p = StaticCredentialProvider::new().with("ghcr.io", "user", "pass");
        assert!(p.resolve("ghcr.io", "scope").is_some());
        assert!(p.resolve("registry-1.docker.io", "scope").is_none());
    }
}
