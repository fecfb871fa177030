//! Hot-swappable spec handles.

use super::Spec;
use crate::types::{Error, Result};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Yields the current compiled spec snapshot.
///
/// Callers take one snapshot per use and step against it; a concurrent
/// update never changes a snapshot already handed out.
pub trait Specter: Send + Sync + fmt::Debug {
    fn spec(&self) -> Arc<Spec>;
}

/// A spec that can be replaced in place by a newer compiled version.
#[derive(Debug)]
pub struct UpdatableSpec {
    current: RwLock<Arc<Spec>>,
}

impl UpdatableSpec {
    pub fn new(spec: Spec) -> Result<Self> {
        ensure_compiled(&spec)?;
        Ok(Self {
            current: RwLock::new(Arc::new(spec)),
        })
    }

    /// Swap in `spec`. Only compiled specs are accepted.
    pub fn set_spec(&self, spec: Spec) -> Result<()> {
        ensure_compiled(&spec)?;
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(spec = %spec.name, "spec updated");
        *current = Arc::new(spec);
        Ok(())
    }
}

impl Specter for UpdatableSpec {
    fn spec(&self) -> Arc<Spec> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn ensure_compiled(spec: &Spec) -> Result<()> {
    if !spec.is_compiled() {
        return Err(Error::SpecNotCompiled(spec.name.clone()));
    }
    Ok(())
}
