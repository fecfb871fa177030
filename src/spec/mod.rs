//! Machine specifications.
//!
//! A [`Spec`] is a named graph of [`Node`]s. Each node may run an action and
//! may offer [`Branches`] to other nodes. A spec is plain data until
//! [`Spec::compile`] resolves every action and guard through an
//! [`InterpreterRegistry`] and parses every branch pattern; only then can it
//! be stepped.
//!
//! Specs serialize in camelCase and load from JSON or YAML.

mod specter;

pub use specter::{Specter, UpdatableSpec};

use crate::action::{Action, ActionSource, InterpreterRegistry};
use crate::matcher::validate_pattern;
use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the error node when a spec doesn't say otherwise.
pub const DEFAULT_ERROR_NODE: &str = "error";

// =============================================================================
// Model
// =============================================================================

/// A declarative machine: nodes, branches, actions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub doc: String,

    /// Parameters a machine running this spec expects in its bindings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub param_specs: BTreeMap<String, ParamSpec>,

    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_node: Option<String>,

    /// Don't add an error node when the spec lacks one.
    #[serde(default)]
    pub no_auto_error_node: bool,

    /// Let branches inspect `actionError` instead of failing the step.
    #[serde(default)]
    pub action_error_branches: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<ActionSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toob: Option<ActionSource>,

    /// How string patterns are parsed: "", "none", "json" or "yaml".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern_syntax: String,

    #[serde(skip)]
    compiled: bool,

    #[serde(skip)]
    boot_action: Option<Arc<dyn Action>>,

    #[serde(skip)]
    toob_action: Option<Arc<dyn Action>>,
}

/// A machine parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub doc: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primitive_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default)]
    pub optional: bool,
}

/// A named state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub doc: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionSource>,

    /// `None` makes the node terminal.
    #[serde(default, rename = "branching", skip_serializing_if = "Option::is_none")]
    pub branches: Option<Branches>,

    #[serde(skip)]
    compiled_action: Option<Arc<dyn Action>>,
}

/// What a node's branches match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// The pending message; a tried branch consumes it.
    Message,
    /// The current bindings.
    Bindings,
}

impl BranchKind {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "message" => Ok(Self::Message),
            "" | "bindings" => Ok(Self::Bindings),
            other => Err(Error::UnknownBranchType(other.to_string())),
        }
    }
}

/// Ordered possible transitions out of a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Branches {
    /// "message" or "bindings" (the default when empty).
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default)]
    pub branches: Vec<Branch>,
}

impl Branches {
    pub fn kind(&self) -> Result<BranchKind> {
        BranchKind::parse(&self.kind)
    }
}

/// One pattern-conditioned, optionally guarded transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<ActionSource>,

    /// Node name, or `@var` to use the string bound to `var`.
    pub target: String,

    #[serde(skip)]
    compiled_pattern: Option<Value>,

    #[serde(skip)]
    compiled_guard: Option<Arc<dyn Action>>,
}

impl Branch {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn when(pattern: Value, target: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern),
            ..Self::to(target)
        }
    }

    /// The parsed pattern; `None` matches everything.
    pub fn compiled_pattern(&self) -> Option<&Value> {
        self.compiled_pattern.as_ref()
    }

    pub fn compiled_guard(&self) -> Option<&Arc<dyn Action>> {
        self.compiled_guard.as_ref()
    }
}

impl Node {
    pub fn compiled_action(&self) -> Option<&Arc<dyn Action>> {
        self.compiled_action.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.branches
            .as_ref()
            .map(|b| b.branches.is_empty())
            .unwrap_or(true)
    }
}

// =============================================================================
// Loading
// =============================================================================

impl Spec {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Parse JSON when the text looks like a JSON object, YAML otherwise.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim_start().starts_with('{') {
            Self::from_json(text)
        } else {
            Self::from_yaml(text)
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

// =============================================================================
// Compilation
// =============================================================================

impl Spec {
    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn error_node_name(&self) -> &str {
        match self.error_node.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_ERROR_NODE,
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn boot_action(&self) -> Option<&Arc<dyn Action>> {
        self.boot_action.as_ref()
    }

    pub fn toob_action(&self) -> Option<&Arc<dyn Action>> {
        self.toob_action.as_ref()
    }

    /// Consume and return the compiled spec.
    pub fn compiled(mut self, interpreters: &InterpreterRegistry) -> Result<Self> {
        self.compile(interpreters, false)?;
        Ok(self)
    }

    /// Resolve actions, guards and patterns. A compiled spec is left alone
    /// unless `force` is set. On failure the spec is not marked compiled.
    pub fn compile(&mut self, interpreters: &InterpreterRegistry, force: bool) -> Result<()> {
        if self.compiled && !force {
            return Ok(());
        }
        self.compiled = false;

        let syntax = PatternSyntax::parse(&self.pattern_syntax)?;

        self.boot_action = match &self.boot {
            Some(src) => Some(interpreters.compile(src).map_err(|e| context("boot", e))?),
            None => None,
        };
        self.toob_action = match &self.toob {
            Some(src) => Some(interpreters.compile(src).map_err(|e| context("toob", e))?),
            None => None,
        };

        if !self.no_auto_error_node {
            let error_node = self.error_node_name().to_string();
            self.nodes.entry(error_node).or_insert_with(|| Node {
                doc: "Automatically added error node".to_string(),
                ..Node::default()
            });
        }

        for (name, node) in self.nodes.iter_mut() {
            compile_node(name, node, interpreters, syntax)?;
        }

        self.compiled = true;
        tracing::debug!(spec = %self.name, nodes = self.nodes.len(), "compiled spec");
        Ok(())
    }
}

fn compile_node(
    name: &str,
    node: &mut Node,
    interpreters: &InterpreterRegistry,
    syntax: PatternSyntax,
) -> Result<()> {
    node.compiled_action = match &node.action {
        Some(src) => Some(
            interpreters
                .compile(src)
                .map_err(|e| context(&format!("node {} action", name), e))?,
        ),
        None => None,
    };

    let Some(branches) = node.branches.as_mut() else {
        return Ok(());
    };

    let kind = branches.kind()?;
    if kind == BranchKind::Message && node.action.is_some() {
        return Err(Error::BadBranching(name.to_string()));
    }

    for (i, branch) in branches.branches.iter_mut().enumerate() {
        branch.compiled_guard = match &branch.guard {
            Some(src) => Some(
                interpreters
                    .compile(src)
                    .map_err(|e| context(&format!("node {} branch {} guard", name, i), e))?,
            ),
            None => None,
        };
        branch.compiled_pattern = match &branch.pattern {
            Some(raw) => {
                let parsed = syntax
                    .parse_pattern(raw)
                    .and_then(|p| canonicalize(&p))
                    .map_err(|e| context(&format!("node {} branch {} pattern", name, i), e))?;
                validate_pattern(&parsed)?;
                Some(parsed)
            }
            None => None,
        };
    }
    Ok(())
}

/// Prefix compile errors with where they happened. Other error kinds keep
/// their type so callers can match on them.
fn context(location: &str, err: Error) -> Error {
    match err {
        Error::Compile(msg) => Error::Compile(format!("{}: {}", location, msg)),
        Error::Serialization(e) => Error::Compile(format!("{}: {}", location, e)),
        Error::Yaml(e) => Error::Compile(format!("{}: {}", location, e)),
        other => other,
    }
}

// =============================================================================
// Patterns
// =============================================================================

/// How a spec writes its branch patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSyntax {
    /// Patterns are given as structured values.
    None,
    /// String patterns hold JSON text.
    Json,
    /// String patterns hold YAML text.
    Yaml,
}

impl PatternSyntax {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "" | "none" => Ok(Self::None),
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            other => Err(Error::compile(format!("unknown pattern syntax '{}'", other))),
        }
    }

    pub fn parse_pattern(self, raw: &Value) -> Result<Value> {
        match (self, raw) {
            (Self::Json, Value::String(text)) => Ok(serde_json::from_str(text)?),
            (Self::Yaml, Value::String(text)) => Ok(serde_yaml::from_str(text)?),
            _ => Ok(raw.clone()),
        }
    }
}

/// Round-trip through the wire encoding so equal patterns have equal shape.
pub fn canonicalize(pattern: &Value) -> Result<Value> {
    let text = serde_json::to_string(pattern)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Execution, FuncAction, NativeInterpreter};
    use serde_json::json;

    fn registry() -> InterpreterRegistry {
        InterpreterRegistry::default().with(
            "native",
            Arc::new(NativeInterpreter::new().register(FuncAction::new("id", |_, bs, _| {
                Ok(Execution::with_bindings(bs.clone()))
            }))),
        )
    }

    fn turnstile() -> Spec {
        Spec::from_value(json!({
            "name": "turnstile",
            "nodes": {
                "locked": {"branching": {"type": "message", "branches": [
                    {"pattern": {"input": "coin"}, "target": "unlocked"},
                    {"pattern": {"input": "push"}, "target": "locked"}
                ]}},
                "unlocked": {"branching": {"type": "message", "branches": [
                    {"pattern": {"input": "push"}, "target": "locked"},
                    {"pattern": {"input": "coin"}, "target": "unlocked"}
                ]}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_error_node_added() {
        let spec = turnstile().compiled(&registry()).unwrap();
        assert!(spec.is_compiled());
        let error = spec.node("error").unwrap();
        assert!(error.is_terminal());
        assert!(error.action.is_none());
    }

    #[test]
    fn test_error_node_suppressed() {
        let mut spec = turnstile();
        spec.no_auto_error_node = true;
        spec.compile(&registry(), false).unwrap();
        assert!(spec.node("error").is_none());
    }

    #[test]
    fn test_custom_error_node_name() {
        let mut spec = turnstile();
        spec.error_node = Some("oops".into());
        spec.compile(&registry(), false).unwrap();
        assert!(spec.node("oops").is_some());
        assert!(spec.node("error").is_none());
    }

    #[test]
    fn test_unknown_branch_type() {
        let mut spec = turnstile();
        spec.nodes
            .get_mut("locked")
            .unwrap()
            .branches
            .as_mut()
            .unwrap()
            .kind = "sideways".into();
        let err = spec.compile(&registry(), false).unwrap_err();
        assert!(matches!(err, Error::UnknownBranchType(_)));
        assert!(!spec.is_compiled());
    }

    #[test]
    fn test_unknown_interpreter_fails_compile() {
        let mut spec = turnstile();
        spec.nodes.get_mut("unlocked").unwrap().action =
            Some(ActionSource::new("lisp", json!("(+ 1 2)")));
        let err = spec.compile(&registry(), false).unwrap_err();
        assert!(matches!(err, Error::InterpreterNotFound(_)));
        assert!(!spec.is_compiled());
    }

    #[test]
    fn test_action_with_message_branches_rejected() {
        let mut spec = turnstile();
        spec.nodes.get_mut("locked").unwrap().action =
            Some(ActionSource::new("native", json!("id")));
        let err = spec.compile(&registry(), false).unwrap_err();
        assert!(matches!(err, Error::BadBranching(node) if node == "locked"));
    }

    #[test]
    fn test_json_pattern_syntax() {
        let mut spec = Spec::from_value(json!({
            "patternSyntax": "json",
            "nodes": {"start": {"branching": {"branches": [
                {"pattern": "{\"?x\": 1}", "target": "start"}
            ]}}}
        }))
        .unwrap();
        spec.compile(&registry(), false).unwrap();
        let branch = &spec.node("start").unwrap().branches.as_ref().unwrap().branches[0];
        assert_eq!(branch.compiled_pattern(), Some(&json!({"?x": 1})));
    }

    #[test]
    fn test_bad_pattern_syntax() {
        let mut spec = turnstile();
        spec.pattern_syntax = "toml".into();
        assert!(matches!(spec.compile(&registry(), false), Err(Error::Compile(_))));
    }

    #[test]
    fn test_bad_property_variable_caught_at_compile() {
        let mut spec = turnstile();
        spec.nodes.get_mut("locked").unwrap().branches.as_mut().unwrap().branches[0].pattern =
            Some(json!({"?k": 1, "input": "coin"}));
        let err = spec.compile(&registry(), false).unwrap_err();
        assert!(matches!(err, Error::BadPropertyVariable(_)));
    }

    #[test]
    fn test_boot_and_toob_compiled() {
        let mut spec = turnstile();
        spec.boot = Some(ActionSource::new("native", json!("id")));
        spec.compile(&registry(), false).unwrap();
        assert!(spec.boot_action().is_some());
        assert!(spec.toob_action().is_none());
    }

    #[test]
    fn test_yaml_spec_round_trip() {
        let spec = Spec::parse(
            "name: double\nnodes:\n  start:\n    branching:\n      type: message\n      branches:\n        - pattern: {double: '?n'}\n          target: start\n",
        )
        .unwrap();
        assert_eq!(spec.name, "double");
        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            back["nodes"]["start"]["branching"]["branches"][0]["pattern"],
            json!({"double": "?n"})
        );
    }
}
