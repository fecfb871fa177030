//! Machines, their spec references and persisted records.

use crate::matcher::Bindings;
use crate::spec::Spec;
use crate::types::{CrewId, MachineId};
use crate::walker::State;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a machine's spec comes from. The first non-empty of `inline`,
/// `source`, `url` and `name` wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// `file://` or `http(s)://` location of JSON or YAML spec text.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// JSON or YAML spec text.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<Box<Spec>>,
}

impl SpecSource {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn text(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn inline(spec: Spec) -> Self {
        Self {
            inline: Some(Box::new(spec)),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inline.is_none() && self.source.is_empty() && self.url.is_empty() && self.name.is_empty()
    }
}

/// Persisted form of one machine. `deleted` marks a tombstone write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineState {
    pub id: MachineId,
    pub spec_source: SpecSource,
    pub node: String,
    #[serde(default)]
    pub bindings: Bindings,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// One running instance of a spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub spec: SpecSource,
    pub state: State,
}

impl Machine {
    pub fn to_record(&self) -> MachineState {
        MachineState {
            id: self.id.clone(),
            spec_source: self.spec.clone(),
            node: self.state.node.clone(),
            bindings: self.state.bs.clone(),
            deleted: false,
        }
    }

    pub fn from_record(record: MachineState) -> Self {
        Self {
            id: record.id,
            spec: record.spec_source,
            state: State::new(record.node, record.bindings),
        }
    }
}

/// A crew's machines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crew {
    pub id: CrewId,
    pub machines: BTreeMap<MachineId, Machine>,
}

impl Crew {
    pub fn new(id: CrewId) -> Self {
        Self {
            id,
            machines: BTreeMap::new(),
        }
    }

    pub fn from_records(id: CrewId, records: Vec<MachineState>) -> Self {
        let machines = records
            .into_iter()
            .filter(|r| !r.deleted)
            .map(|r| (r.id.clone(), Machine::from_record(r)))
            .collect();
        Self { id, machines }
    }
}

/// Request to add a machine to a crew.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineInit {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<MachineId>,
    #[serde(default)]
    pub spec: SpecSource,
    /// Defaults to the runtime's configured start node.
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub bindings: Option<Bindings>,
}

impl MachineInit {
    pub fn new(id: impl Into<MachineId>, spec: SpecSource) -> Self {
        Self {
            id: Some(id.into()),
            spec,
            ..Self::default()
        }
    }

    pub fn at(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_bindings(mut self, bindings: Bindings) -> Self {
        self.bindings = Some(bindings);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_round_trip() {
        let machine = Machine {
            id: MachineId::from("m1"),
            spec: SpecSource::named("turnstile"),
            state: State::new("locked", Bindings::from_value(json!({"n": 1})).unwrap()),
        };
        let record = machine.to_record();
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(
            v,
            json!({"id": "m1", "specSource": {"name": "turnstile"}, "node": "locked", "bindings": {"n": 1}})
        );
        let back = Machine::from_record(record);
        assert_eq!(back.state, machine.state);
    }

    #[test]
    fn test_tombstones_skipped() {
        let mut gone = Machine {
            id: MachineId::from("gone"),
            spec: SpecSource::named("x"),
            state: State::at("start"),
        }
        .to_record();
        gone.deleted = true;
        let crew = Crew::from_records(CrewId::from("c"), vec![gone]);
        assert!(crew.machines.is_empty());
    }

    #[test]
    fn test_empty_source() {
        assert!(SpecSource::default().is_empty());
        assert!(!SpecSource::named("x").is_empty());
    }
}
