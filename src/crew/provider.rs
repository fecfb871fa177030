//! Resolving a machine's [`SpecSource`] to a compiled, swappable spec.

use super::machine::SpecSource;
use crate::action::InterpreterRegistry;
use crate::spec::{Spec, Specter, UpdatableSpec};
use crate::types::{Error, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Loaded specs kept by a library built with [`SpecLibrary::new`].
pub const DEFAULT_SPEC_CACHE_CAPACITY: usize = 256;

/// Digest of a spec source descriptor.
type SourceKey = [u8; 32];

/// Finds specs for machines.
#[async_trait]
pub trait SpecProvider: Send + Sync + fmt::Debug {
    async fn find_spec(&self, source: &SpecSource) -> Result<Arc<dyn Specter>>;
}

/// Named specs plus a bounded cache of specs loaded from text, URLs and
/// inline bodies.
///
/// Every spec is compiled against the library's interpreters before it is
/// handed out. Named specs can be replaced with [`SpecLibrary::update`];
/// machines holding the handle see the new version on their next step.
/// Loaded specs are keyed by a digest of their descriptor and the least
/// recently used one is dropped once the cache is full.
pub struct SpecLibrary {
    interpreters: InterpreterRegistry,
    named: RwLock<HashMap<String, Arc<UpdatableSpec>>>,
    loaded: Mutex<LruCache<SourceKey, Arc<UpdatableSpec>>>,
    http: reqwest::Client,
}

impl SpecLibrary {
    pub fn new(interpreters: InterpreterRegistry) -> Self {
        Self::with_capacity(interpreters, DEFAULT_SPEC_CACHE_CAPACITY)
    }

    pub fn with_capacity(interpreters: InterpreterRegistry, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            interpreters,
            named: RwLock::new(HashMap::new()),
            loaded: Mutex::new(LruCache::new(capacity)),
            http: reqwest::Client::new(),
        }
    }

    pub fn interpreters(&self) -> &InterpreterRegistry {
        &self.interpreters
    }

    /// Compile and register `spec` under its name.
    pub async fn register(&self, spec: Spec) -> Result<()> {
        crate::validation::validate_non_empty(&spec.name, "spec name")?;
        let spec = spec.compiled(&self.interpreters)?;
        let name = spec.name.clone();
        let mut named = self.named.write().await;
        if named.contains_key(&name) {
            return Err(Error::exists(format!("spec {}", name)));
        }
        named.insert(name.clone(), Arc::new(UpdatableSpec::new(spec)?));
        tracing::info!("Registered spec {}", name);
        Ok(())
    }

    /// Swap in a new version of a registered spec, or register it.
    pub async fn update(&self, spec: Spec) -> Result<()> {
        crate::validation::validate_non_empty(&spec.name, "spec name")?;
        let spec = spec.compiled(&self.interpreters)?;
        let mut named = self.named.write().await;
        match named.get(&spec.name) {
            Some(specter) => specter.set_spec(spec)?,
            None => {
                let name = spec.name.clone();
                named.insert(name, Arc::new(UpdatableSpec::new(spec)?));
            }
        }
        Ok(())
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.named.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of loaded specs currently cached.
    pub fn loaded_len(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, LruCache<SourceKey, Arc<UpdatableSpec>>> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached(&self, key: &SourceKey) -> Option<Arc<dyn Specter>> {
        self.cache().get(key).map(|s| s.clone() as Arc<dyn Specter>)
    }

    /// Cache `spec` under `key`. A concurrent load may have won; keep its
    /// handle.
    fn remember(&self, key: SourceKey, spec: Spec) -> Result<Arc<dyn Specter>> {
        let specter = Arc::new(UpdatableSpec::new(spec)?);
        let mut cache = self.cache();
        let specter = cache.get_or_insert(key, || specter).clone();
        Ok(specter)
    }

    async fn load(&self, key: SourceKey, fetch: impl std::future::Future<Output = Result<String>>) -> Result<Arc<dyn Specter>> {
        if let Some(specter) = self.cached(&key) {
            return Ok(specter);
        }
        let text = fetch.await?;
        let spec = Spec::parse(&text)?.compiled(&self.interpreters)?;
        self.remember(key, spec)
    }

    fn load_inline(&self, spec: &Spec) -> Result<Arc<dyn Specter>> {
        let key = source_key("inline", &serde_json::to_vec(spec)?);
        if let Some(specter) = self.cached(&key) {
            return Ok(specter);
        }
        let spec = spec.clone().compiled(&self.interpreters)?;
        self.remember(key, spec)
    }

    async fn fetch_url(&self, url: &str) -> Result<String> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::spec_source(format!("{}: {}", url, e)));
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            tracing::debug!("Fetching spec from {}", url);
            let response = self
                .http
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| Error::spec_source(format!("{}: {}", url, e)))?;
            return response
                .text()
                .await
                .map_err(|e| Error::spec_source(format!("{}: {}", url, e)));
        }
        Err(Error::spec_source(format!("unsupported spec url: {}", url)))
    }
}

#[async_trait]
impl SpecProvider for SpecLibrary {
    async fn find_spec(&self, source: &SpecSource) -> Result<Arc<dyn Specter>> {
        if let Some(inline) = &source.inline {
            return self.load_inline(inline);
        }
        if !source.source.is_empty() {
            let key = source_key("source", source.source.as_bytes());
            let text = source.source.clone();
            return self.load(key, async move { Ok(text) }).await;
        }
        if !source.url.is_empty() {
            let key = source_key("url", source.url.as_bytes());
            return self.load(key, self.fetch_url(&source.url)).await;
        }
        if !source.name.is_empty() {
            return self
                .named
                .read()
                .await
                .get(&source.name)
                .map(|s| s.clone() as Arc<dyn Specter>)
                .ok_or_else(|| Error::not_found(format!("spec {}", source.name)));
        }
        Err(Error::validation("empty spec source"))
    }
}

/// Domain-separated digest so a url and source text never share a key.
fn source_key(kind: &str, body: &[u8]) -> SourceKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_bytes());
    hasher.update(&[0]);
    hasher.update(body);
    *hasher.finalize().as_bytes()
}

impl fmt::Debug for SpecLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecLibrary")
            .field("interpreters", &self.interpreters.names())
            .field("loaded", &self.loaded_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn spec(name: &str, target: &str) -> Spec {
        Spec::from_value(json!({
            "name": name,
            "nodes": {"start": {"branching": {"branches": [{"target": target}]}}}
        }))
        .unwrap()
    }

    fn target(specter: &Arc<dyn Specter>) -> String {
        let spec = specter.spec();
        let node = spec.node("start").unwrap();
        node.branches.as_ref().unwrap().branches[0].target.clone()
    }

    #[tokio::test]
    async fn test_named_lookup_and_update() {
        let library = SpecLibrary::new(InterpreterRegistry::default());
        library.register(spec("s", "one")).await.unwrap();
        assert!(matches!(
            library.register(spec("s", "again")).await,
            Err(Error::Exists(_))
        ));

        let specter = library.find_spec(&SpecSource::named("s")).await.unwrap();
        assert_eq!(target(&specter), "one");

        library.update(spec("s", "two")).await.unwrap();
        assert_eq!(target(&specter), "two");
        assert_eq!(library.names().await, vec!["s"]);
    }

    #[tokio::test]
    async fn test_unknown_name() {
        let library = SpecLibrary::new(InterpreterRegistry::default());
        let err = library.find_spec(&SpecSource::named("nope")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = library.find_spec(&SpecSource::default()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_source_text_is_cached() {
        let library = SpecLibrary::new(InterpreterRegistry::default());
        let text = "name: y\nnodes:\n  start:\n    branching:\n      branches:\n        - target: done\n";
        let a = library.find_spec(&SpecSource::text(text)).await.unwrap();
        let b = library.find_spec(&SpecSource::text(text)).await.unwrap();
        assert_eq!(target(&a), "done");
        assert!(Arc::ptr_eq(&a.spec(), &b.spec()));
    }

    #[tokio::test]
    async fn test_inline_and_file_url() {
        let library = SpecLibrary::new(InterpreterRegistry::default());
        let inline = library.find_spec(&SpecSource::inline(spec("i", "x"))).await.unwrap();
        assert!(inline.spec().is_compiled());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", json!({"name": "f", "nodes": {"start": {"branching": {"branches": [{"target": "z"}]}}}})).unwrap();
        let url = format!("file://{}", file.path().display());
        let specter = library.find_spec(&SpecSource::url(url)).await.unwrap();
        assert_eq!(target(&specter), "z");
    }

    #[tokio::test]
    async fn test_inline_compiled_once() {
        let library = SpecLibrary::new(InterpreterRegistry::default());
        let a = library.find_spec(&SpecSource::inline(spec("i", "x"))).await.unwrap();
        let b = library.find_spec(&SpecSource::inline(spec("i", "x"))).await.unwrap();
        assert!(Arc::ptr_eq(&a.spec(), &b.spec()));

        let c = library.find_spec(&SpecSource::inline(spec("i", "y"))).await.unwrap();
        assert_eq!(target(&c), "y");
        assert_eq!(library.loaded_len(), 2);
    }

    #[tokio::test]
    async fn test_loaded_cache_is_bounded() {
        let library = SpecLibrary::with_capacity(InterpreterRegistry::default(), 2);
        let text = |t: &str| {
            SpecSource::text(json!({"name": "t", "nodes": {"start": {"branching": {"branches": [{"target": t}]}}}}).to_string())
        };
        let first = library.find_spec(&text("a")).await.unwrap();
        library.find_spec(&text("b")).await.unwrap();
        library.find_spec(&text("c")).await.unwrap();
        assert_eq!(library.loaded_len(), 2);

        // "a" was least recently used, so it comes back as a fresh compile.
        let again = library.find_spec(&text("a")).await.unwrap();
        assert_eq!(target(&again), "a");
        assert!(!Arc::ptr_eq(&first.spec(), &again.spec()));
        assert_eq!(library.loaded_len(), 2);
    }

    #[tokio::test]
    async fn test_bad_urls() {
        let library = SpecLibrary::new(InterpreterRegistry::default());
        let err = library.find_spec(&SpecSource::url("ftp://x/y")).await.unwrap_err();
        assert!(matches!(err, Error::SpecSource(_)));
        let err = library
            .find_spec(&SpecSource::url("file:///definitely/not/here.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SpecSource(_)));
    }
}
