use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::error::{CompilateError, CompilateResult};
use crate::node::SourceContext;

/// Resolves template names to source code. Implementations decide where
/// templates live; the environment only ever asks by name.
pub trait Loader {
    /// Returns the source for a name, or `MissingTemplate`.
    fn resolve(&self, name: &str) -> CompilateResult<SourceContext>;

    /// A stable key identifying the template's content location, used to
    /// address the artifact cache.
    fn cache_key(&self, name: &str) -> CompilateResult<String>;

    /// Whether a template is unchanged since `timestamp` (seconds).
    fn is_fresh(&self, name: &str, timestamp: u64) -> bool;
}

/// In-memory loader over a fixed name-to-source map. Templates never go
/// stale.
#[derive(Debug, Clone, Default)]
pub struct ArrayLoader {
    templates: BTreeMap<String, String>,
}

impl ArrayLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<N: Into<String>, C: Into<String>>(&mut self, name: N, code: C) {
        self.templates.insert(name.into(), code.into());
    }
}

impl Loader for ArrayLoader {
    fn resolve(&self, name: &str) -> CompilateResult<SourceContext> {
        match self.templates.get(name) {
            Some(code) => Ok(SourceContext::new(name, code.clone())),
            None => Err(CompilateError::MissingTemplate {
                template_name: name.to_string(),
            }),
        }
    }

    fn cache_key(&self, name: &str) -> CompilateResult<String> {
        if self.templates.contains_key(name) {
            Ok(format!("array:{name}"))
        } else {
            Err(CompilateError::MissingTemplate {
                template_name: name.to_string(),
            })
        }
    }

    fn is_fresh(&self, name: &str, _timestamp: u64) -> bool {
        self.templates.contains_key(name)
    }
}

/// Stores generated artifacts for reuse outside the compiling process.
pub trait ArtifactCache {
    fn load(&self, key: &str) -> Option<String>;
    fn write(&self, key: &str, source: &str);
    /// When the artifact under `key` was written, if known.
    fn timestamp(&self, key: &str) -> Option<u64>;
}

/// Keeps artifacts in process memory. Mostly useful for tests and for
/// inspecting what the compiler emitted.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RefCell<BTreeMap<String, (String, u64)>>,
    clock: RefCell<u64>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactCache for MemoryCache {
    fn load(&self, key: &str) -> Option<String> {
        self.entries
            .borrow()
            .get(key)
            .map(|(source, _)| source.clone())
    }

    fn write(&self, key: &str, source: &str) {
        let mut clock = self.clock.borrow_mut();
        *clock += 1;
        self.entries
            .borrow_mut()
            .insert(key.to_string(), (source.to_string(), *clock));
    }

    fn timestamp(&self, key: &str) -> Option<u64> {
        self.entries.borrow().get(key).map(|(_, ts)| *ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_array_loader_resolve() {
        let mut loader = ArrayLoader::new();
        loader.insert("index.html", "hello");
        let source = loader.resolve("index.html").unwrap();
        assert_eq!(source.name, "index.html");
        assert_eq!(source.code, "hello");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_array_loader_missing() {
        let loader = ArrayLoader::new();
        let err = loader.resolve("nope").unwrap_err();
        assert!(matches!(err, CompilateError::MissingTemplate { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        assert!(cache.load("k").is_none());
        cache.write("k", "artifact");
        assert_eq!(cache.load("k").as_deref(), Some("artifact"));
        let first = cache.timestamp("k").unwrap();
        cache.write("k", "artifact2");
        assert!(cache.timestamp("k").unwrap() > first);
    }
}
