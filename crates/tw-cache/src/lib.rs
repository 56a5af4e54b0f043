#![forbid(unsafe_code)]

//! Per-wrapper cache of engine-staged callables keyed by call structure and
//! leaf shapes.
//!
//! An entry is only visible after its callable has run once and recorded the
//! structure of its outputs; see [`TransformCache::commit`].

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, trace};
use tw_core::{ErrorKind, TreeDef};
use tw_engine::{EngineError, FlatFn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub digest_hex: String,
}

impl CacheKey {
    /// SHA-256 of the descriptor's canonical fingerprint.
    #[must_use]
    pub fn from_treedef(def: &TreeDef) -> Self {
        Self::digest(def.canonical_fingerprint().as_bytes())
    }

    /// Like [`CacheKey::from_treedef`], with the leaf shapes appended to the
    /// fingerprint. A signature without shapes digests like its descriptor.
    #[must_use]
    pub fn from_signature(signature: &CallSignature) -> Self {
        let mut fingerprint = signature.structure.canonical_fingerprint();
        if let Some(shapes) = &signature.shapes {
            fingerprint.push_str("|shapes=");
            for shape in shapes {
                let dims: Vec<String> = shape.iter().map(usize::to_string).collect();
                fingerprint.push('[');
                fingerprint.push_str(&dims.join(","));
                fingerprint.push(']');
            }
        }
        Self::digest(fingerprint.as_bytes())
    }

    fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        Self {
            namespace: "twx",
            digest_hex: bytes_to_hex(&digest),
        }
    }

    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.namespace, self.digest_hex)
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{:02x}", byte));
    }
    out
}

/// What a cache entry is keyed by: the call descriptor, plus the shape of
/// every tensor leaf in order unless the staged callable is shape-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSignature {
    pub structure: TreeDef,
    pub shapes: Option<Vec<Vec<usize>>>,
}

impl CallSignature {
    #[must_use]
    pub fn shaped(structure: TreeDef, shapes: Vec<Vec<usize>>) -> Self {
        Self {
            structure,
            shapes: Some(shapes),
        }
    }

    /// Keys by structure alone, for callables that tolerate varying shapes.
    #[must_use]
    pub fn shapeless(structure: TreeDef) -> Self {
        Self {
            structure,
            shapes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    MissingOutputStructure { key: String },
}

impl CacheError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingOutputStructure { .. } => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingOutputStructure { key } => {
                write!(f, "missing output structure from compiled function ({key})")
            }
        }
    }
}

impl std::error::Error for CacheError {}

/// Write-once holder for the output descriptor of a staged callable.
///
/// Clones share the same slot, so the callable can record into it while the
/// cache keeps a handle.
#[derive(Debug, Clone, Default)]
pub struct OutputSlot(Arc<OnceLock<TreeDef>>);

impl OutputSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `def` unless a descriptor was already recorded. Returns whether
    /// this call stored it.
    pub fn record(&self, def: TreeDef) -> bool {
        self.0.set(def).is_ok()
    }

    #[must_use]
    pub fn get(&self) -> Option<&TreeDef> {
        self.0.get()
    }

    #[must_use]
    pub fn is_recorded(&self) -> bool {
        self.0.get().is_some()
    }
}

/// A staged callable and the output structure it produces.
pub struct CacheEntry<T> {
    key: CacheKey,
    compiled: FlatFn<T>,
    output: OutputSlot,
}

impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            compiled: Arc::clone(&self.compiled),
            output: self.output.clone(),
        }
    }
}

impl<T> std::fmt::Debug for CacheEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl<T> CacheEntry<T> {
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    #[must_use]
    pub fn compiled(&self) -> &FlatFn<T> {
        &self.compiled
    }

    #[must_use]
    pub fn output_slot(&self) -> &OutputSlot {
        &self.output
    }

    pub fn output_def(&self) -> Result<&TreeDef, CacheError> {
        self.output
            .get()
            .ok_or_else(|| CacheError::MissingOutputStructure {
                key: self.key.as_string(),
            })
    }

    pub fn call(&self, leaves: &[T]) -> Result<Vec<T>, EngineError> {
        (self.compiled)(leaves)
    }
}

/// A freshly built entry that has not been committed yet.
#[derive(Debug)]
pub struct PendingEntry<T> {
    signature: CallSignature,
    entry: CacheEntry<T>,
}

impl<T> PendingEntry<T> {
    #[must_use]
    pub fn entry(&self) -> &CacheEntry<T> {
        &self.entry
    }

    #[must_use]
    pub fn signature(&self) -> &CallSignature {
        &self.signature
    }
}

#[derive(Debug)]
pub enum CacheLookup<T> {
    Hit(CacheEntry<T>),
    Miss(PendingEntry<T>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
}

/// Unbounded map from call signature to staged callable.
pub struct TransformCache<T> {
    label: &'static str,
    entries: Mutex<FxHashMap<CallSignature, CacheEntry<T>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<T> std::fmt::Debug for TransformCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformCache")
            .field("label", &self.label)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T> TransformCache<T> {
    /// `label` names the transform in log events (`"compile"`, `"checkpoint"`).
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: Mutex::new(FxHashMap::default()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<CallSignature, CacheEntry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the committed entry for `signature`, or builds a pending one.
    ///
    /// `build` receives the slot the staged callable must record its output
    /// descriptor into. The map is not locked while `build` runs.
    pub fn lookup_or_build<E>(
        &self,
        signature: &CallSignature,
        build: impl FnOnce(OutputSlot) -> Result<FlatFn<T>, E>,
    ) -> Result<CacheLookup<T>, E> {
        if let Some(entry) = self.lock().get(signature) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(cache = self.label, key = %entry.key, "cache hit");
            return Ok(CacheLookup::Hit(entry.clone()));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let key = CacheKey::from_signature(signature);
        debug!(
            cache = self.label,
            key = %key,
            input_leaves = signature.structure.leaf_count(),
            shaped = signature.shapes.is_some(),
            "cache miss, staging callable"
        );
        let output = OutputSlot::new();
        let compiled = build(output.clone())?;
        Ok(CacheLookup::Miss(PendingEntry {
            signature: signature.clone(),
            entry: CacheEntry {
                key,
                compiled,
                output,
            },
        }))
    }

    /// Publishes a pending entry once its output structure is known.
    ///
    /// If another caller committed the same structure first, that entry wins
    /// and is returned.
    pub fn commit(&self, pending: PendingEntry<T>) -> Result<CacheEntry<T>, CacheError> {
        let output_leaves = pending.entry.output_def()?.leaf_count();
        let mut entries = self.lock();
        let entry = entries
            .entry(pending.signature)
            .or_insert(pending.entry)
            .clone();
        debug!(
            cache = self.label,
            key = %entry.key,
            output_leaves,
            entries = entries.len(),
            "committed cache entry"
        );
        Ok(entry)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock().len(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
        debug!(cache = self.label, "cache cleared");
    }
}
