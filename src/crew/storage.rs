//! Crew persistence.

use super::machine::MachineState;
use crate::types::{CrewId, Error, MachineId, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::sync::RwLock;

/// Backing store for crews and machine states.
///
/// `write_state` is all-or-nothing for the records it is given: the runtime
/// only applies state changes in memory after it returns `Ok`.
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Errors with [`Error::Exists`] if the crew is already stored.
    async fn make_crew(&self, cid: &CrewId) -> Result<()>;

    async fn rem_crew(&self, cid: &CrewId) -> Result<()>;

    /// Every live machine record of the crew.
    async fn read_crew(&self, cid: &CrewId) -> Result<Vec<MachineState>>;

    /// Upsert records; a record marked `deleted` removes the machine.
    async fn write_state(&self, cid: &CrewId, states: &[MachineState]) -> Result<()>;
}

/// Process-local storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    crews: RwLock<HashMap<CrewId, BTreeMap<MachineId, MachineState>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn make_crew(&self, cid: &CrewId) -> Result<()> {
        let mut crews = self.crews.write().await;
        if crews.contains_key(cid) {
            return Err(Error::exists(format!("crew {}", cid)));
        }
        crews.insert(cid.clone(), BTreeMap::new());
        Ok(())
    }

    async fn rem_crew(&self, cid: &CrewId) -> Result<()> {
        self.crews
            .write()
            .await
            .remove(cid)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("crew {}", cid)))
    }

    async fn read_crew(&self, cid: &CrewId) -> Result<Vec<MachineState>> {
        self.crews
            .read()
            .await
            .get(cid)
            .map(|machines| machines.values().cloned().collect())
            .ok_or_else(|| Error::not_found(format!("crew {}", cid)))
    }

    async fn write_state(&self, cid: &CrewId, states: &[MachineState]) -> Result<()> {
        let mut crews = self.crews.write().await;
        let machines = crews
            .get_mut(cid)
            .ok_or_else(|| Error::not_found(format!("crew {}", cid)))?;
        for state in states {
            if state.deleted {
                machines.remove(&state.id);
            } else {
                machines.insert(state.id.clone(), state.clone());
            }
        }
        tracing::debug!("Wrote {} machine states for crew {}", states.len(), cid);
        Ok(())
    }
}

/// Accepts every write and remembers nothing.
///
/// Crews live only in the runtime's cache, so an evicted crew is gone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

#[async_trait]
impl Storage for NoopStorage {
    async fn make_crew(&self, _cid: &CrewId) -> Result<()> {
        Ok(())
    }

    async fn rem_crew(&self, _cid: &CrewId) -> Result<()> {
        Ok(())
    }

    async fn read_crew(&self, cid: &CrewId) -> Result<Vec<MachineState>> {
        Err(Error::not_found(format!("crew {}", cid)))
    }

    async fn write_state(&self, _cid: &CrewId, _states: &[MachineState]) -> Result<()> {
        Ok(())
    }
}
