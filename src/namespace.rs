//! Namespace resolution
//!
//! Every backend owns a namespace prefix such as `fs.` or `github_`. Symbols
//! exposed to callers (tool names, prompt names) are the backend's own name
//! with that prefix in front. Prefixes are validated before any descriptor
//! reaches the supervisor: each must be non-empty, end with a separator, and
//! neither equal nor contain another backend's prefix, so at most one prefix
//! ever matches a symbol.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::backend::BackendDescriptor;
use crate::{Error, Result};

/// Characters that may terminate a namespace prefix
pub const SEPARATORS: &[char] = &['.', '_', '/', ':'];

/// Check a single prefix, returning why it is malformed
fn malformed_reason(prefix: &str) -> Option<&'static str> {
    if prefix.trim().is_empty() {
        return Some("namespace prefix is missing or empty");
    }
    if prefix.chars().any(char::is_whitespace) {
        return Some("namespace prefix contains whitespace");
    }
    if !prefix.ends_with(SEPARATORS) {
        return Some("namespace prefix must end with a separator ('.', '_', '/' or ':')");
    }
    if prefix.chars().all(|c| SEPARATORS.contains(&c)) {
        return Some("namespace prefix has no name before its separator");
    }
    None
}

/// Append `.` to a prefix that lacks a trailing separator
///
/// Returns `None` if the prefix is still malformed afterwards.
#[must_use]
pub fn normalize_namespace(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim();
    let normalized = if trimmed.ends_with(SEPARATORS) {
        trimmed.to_string()
    } else {
        format!("{trimmed}.")
    };
    malformed_reason(&normalized).is_none().then_some(normalized)
}

/// Validate a set of `(backend_id, prefix)` pairs
///
/// # Errors
///
/// Returns `Error::Config` naming the offending backend(s) for a malformed,
/// duplicated, or overlapping prefix.
pub fn validate_namespaces<'a, I>(entries: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut entries: Vec<(&str, &str)> = entries.into_iter().collect();
    entries.sort_unstable();

    for (id, prefix) in &entries {
        if let Some(reason) = malformed_reason(prefix) {
            return Err(Error::Config(format!("Backend '{id}': {reason}")));
        }
    }

    for (i, (id_a, prefix_a)) in entries.iter().enumerate() {
        for (id_b, prefix_b) in &entries[i + 1..] {
            if prefix_a == prefix_b {
                return Err(Error::Config(format!(
                    "Backends '{id_a}' and '{id_b}' share namespace prefix '{prefix_a}'"
                )));
            }
            if prefix_a.starts_with(prefix_b) || prefix_b.starts_with(prefix_a) {
                return Err(Error::Config(format!(
                    "Backends '{id_a}' and '{id_b}' have overlapping namespace prefixes '{prefix_a}' and '{prefix_b}'"
                )));
            }
        }
    }

    Ok(())
}

/// Maps qualified symbols to the backend that owns them
#[derive(Debug, Default)]
pub struct NamespaceResolver {
    /// Descriptors, longest prefix first
    entries: Vec<Arc<BackendDescriptor>>,
    /// Descriptors by backend id
    by_id: HashMap<String, Arc<BackendDescriptor>>,
}

impl NamespaceResolver {
    /// Build a resolver, rejecting the whole set on any invalid prefix
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if validation fails.
    pub fn new(descriptors: Vec<BackendDescriptor>) -> Result<Self> {
        validate_namespaces(
            descriptors
                .iter()
                .map(|d| (d.id.as_str(), d.namespace.as_str())),
        )?;
        Ok(Self::index(descriptors))
    }

    /// Build a resolver, skipping descriptors that would make the set invalid
    ///
    /// Used for registry-delivered sets where one bad entry must not take
    /// down the rest of the tenant's backends. Earlier descriptors win.
    #[must_use]
    pub fn lenient(descriptors: Vec<BackendDescriptor>) -> Self {
        let mut accepted: Vec<BackendDescriptor> = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let candidate = accepted
                .iter()
                .map(|d| (d.id.as_str(), d.namespace.as_str()))
                .chain(std::iter::once((desc.id.as_str(), desc.namespace.as_str())));
            let duplicate_id = accepted.iter().any(|d| d.id == desc.id);
            match validate_namespaces(candidate) {
                Ok(()) if !duplicate_id => accepted.push(desc),
                Ok(()) => warn!(backend = %desc.id, "Skipping backend with duplicate id"),
                Err(e) => warn!(backend = %desc.id, error = %e, "Skipping backend with invalid namespace"),
            }
        }
        Self::index(accepted)
    }

    fn index(descriptors: Vec<BackendDescriptor>) -> Self {
        let mut entries: Vec<Arc<BackendDescriptor>> =
            descriptors.into_iter().map(Arc::new).collect();
        entries.sort_by(|a, b| {
            b.namespace
                .len()
                .cmp(&a.namespace.len())
                .then_with(|| a.id.cmp(&b.id))
        });
        let by_id = entries
            .iter()
            .map(|d| (d.id.clone(), Arc::clone(d)))
            .collect();
        Self { entries, by_id }
    }

    /// Find the backend owning `symbol`
    ///
    /// # Errors
    ///
    /// Returns `Error::NoBackendFound` if no prefix matches.
    pub fn resolve(&self, symbol: &str) -> Result<&Arc<BackendDescriptor>> {
        self.entries
            .iter()
            .find(|d| symbol.len() > d.namespace.len() && symbol.starts_with(&d.namespace))
            .ok_or_else(|| Error::NoBackendFound(symbol.to_string()))
    }

    /// Resolve `symbol` and return the owner plus the backend-local name
    ///
    /// # Errors
    ///
    /// Returns `Error::NoBackendFound` if no prefix matches.
    pub fn route<'s>(&self, symbol: &'s str) -> Result<(&Arc<BackendDescriptor>, &'s str)> {
        let desc = self.resolve(symbol)?;
        Ok((desc, strip(desc, symbol)))
    }

    /// Look up a descriptor by backend id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<BackendDescriptor>> {
        self.by_id.get(id)
    }

    /// All descriptors, longest prefix first
    #[must_use]
    pub fn descriptors(&self) -> &[Arc<BackendDescriptor>] {
        &self.entries
    }

    /// Number of backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no backends are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Remove the backend's prefix from a qualified symbol
#[must_use]
pub fn strip<'s>(desc: &BackendDescriptor, symbol: &'s str) -> &'s str {
    symbol.strip_prefix(desc.namespace.as_str()).unwrap_or(symbol)
}

/// Add the backend's prefix to a backend-local name
#[must_use]
pub fn qualify(desc: &BackendDescriptor, name: &str) -> String {
    format!("{}{name}", desc.namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Launch;

    fn desc(id: &str, namespace: &str) -> BackendDescriptor {
        BackendDescriptor::new(
            id,
            namespace,
            Launch::Http {
                url: format!("http://{id}.internal/mcp"),
            },
        )
    }

    #[test]
    fn resolves_and_strips_prefix() {
        // GIVEN: two backends with distinct prefixes
        let resolver =
            NamespaceResolver::new(vec![desc("files", "fs."), desc("github", "gh_")]).unwrap();

        // WHEN: routing qualified symbols
        let (owner, local) = resolver.route("fs.read_file").unwrap();

        // THEN: the owner is found and the prefix is removed
        assert_eq!(owner.id, "files");
        assert_eq!(local, "read_file");
        assert_eq!(resolver.route("gh_create_issue").unwrap().0.id, "github");
        assert_eq!(qualify(owner, "write_file"), "fs.write_file");
    }

    #[test]
    fn unknown_symbol_is_no_backend_found() {
        let resolver = NamespaceResolver::new(vec![desc("files", "fs.")]).unwrap();
        assert!(matches!(
            resolver.resolve("db.query"),
            Err(Error::NoBackendFound(s)) if s == "db.query"
        ));
    }

    #[test]
    fn bare_prefix_does_not_resolve() {
        let resolver = NamespaceResolver::new(vec![desc("files", "fs.")]).unwrap();
        assert!(resolver.resolve("fs.").is_err());
    }

    #[test]
    fn duplicate_prefix_names_both_backends() {
        let err = NamespaceResolver::new(vec![desc("local-fs", "fs."), desc("remote-fs", "fs.")])
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("local-fs"), "{msg}");
        assert!(msg.contains("remote-fs"), "{msg}");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_prefixes_are_rejected() {
        for bad in ["", "  ", "fs", ".", "f s."] {
            let err = validate_namespaces([("b", bad)]).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "prefix {bad:?} accepted");
        }
    }

    #[test]
    fn overlapping_prefixes_are_rejected() {
        let err = validate_namespaces([("a", "fs."), ("b", "fs.sub.")]).unwrap_err();
        assert!(err.to_string().contains("overlapping"));
    }

    #[test]
    fn normalize_appends_separator() {
        assert_eq!(normalize_namespace("fs").as_deref(), Some("fs."));
        assert_eq!(normalize_namespace("gh_").as_deref(), Some("gh_"));
        assert_eq!(normalize_namespace(""), None);
    }

    #[test]
    fn lenient_skips_colliding_entries() {
        // GIVEN: a set where the second entry collides with the first
        let resolver = NamespaceResolver::lenient(vec![
            desc("a", "fs."),
            desc("b", "fs."),
            desc("c", "db."),
            desc("d", "bad"),
        ]);

        // THEN: only the valid, non-colliding entries survive
        assert_eq!(resolver.len(), 2);
        assert!(resolver.get("a").is_some());
        assert!(resolver.get("c").is_some());
    }
}
