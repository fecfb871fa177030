//! Actions: code a node or guard runs against bindings.
//!
//! Two realizations:
//! - [`FuncAction`] wraps a native closure.
//! - [`CompiledAction`] pairs opaque source with the handle an
//!   [`Interpreter`] compiled it into.
//!
//! Actions are always run through [`run`], which preserves permanent
//! bindings (keys ending in `!`) and records a trace event.

mod interpreter;

pub use interpreter::{
    CompiledCode, Interpreter, InterpreterRegistry, NativeInterpreter, NoopInterpreter,
};

use crate::matcher::Bindings;
use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Read-only properties passed to every step (machine id, crew id, ...).
pub type StepProps = Map<String, Value>;

// =============================================================================
// Execution results
// =============================================================================

/// Messages emitted and trace events recorded by an action or a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Events {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emitted: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<Value>,
}

impl Events {
    pub fn emit(&mut self, message: Value) {
        self.emitted.push(message);
    }

    pub fn trace(&mut self, event: Value) {
        self.traces.push(event);
    }

    pub fn absorb(&mut self, other: Events) {
        self.emitted.extend(other.emitted);
        self.traces.extend(other.traces);
    }
}

/// Result of executing an action.
///
/// `bindings == None` means "no bindings": a guard uses it to veto a branch.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub bindings: Option<Bindings>,
    pub events: Events,
}

impl Execution {
    pub fn with_bindings(bindings: Bindings) -> Self {
        Self {
            bindings: Some(bindings),
            events: Events::default(),
        }
    }

    pub fn veto() -> Self {
        Self::default()
    }

    pub fn emitting(mut self, message: Value) -> Self {
        self.events.emit(message);
        self
    }
}

// =============================================================================
// Action trait
// =============================================================================

/// Executable code attached to a node or a branch guard.
pub trait Action: Send + Sync + fmt::Debug {
    fn exec(&self, ctx: &CancellationToken, bs: &Bindings, props: &StepProps) -> Result<Execution>;
}

/// Execute `action`, carrying permanent bindings over from `bs` and
/// recording an execution trace.
pub fn run(
    action: &dyn Action,
    ctx: &CancellationToken,
    bs: &Bindings,
    props: &StepProps,
) -> Result<Execution> {
    if ctx.is_cancelled() {
        return Err(Error::cancelled("action not started"));
    }
    let mut exe = action.exec(ctx, bs, props)?;
    if let Some(out) = exe.bindings.as_mut() {
        for (k, v) in bs.permanent().iter() {
            out.insert(k.clone(), v.clone());
        }
    }
    exe.events.trace(json!({
        "action": "executed",
        "emitted": exe.events.emitted.len(),
    }));
    Ok(exe)
}

// =============================================================================
// Native actions
// =============================================================================

type ActionFn = dyn Fn(&CancellationToken, &Bindings, &StepProps) -> Result<Execution> + Send + Sync;

/// An action backed by a Rust closure.
#[derive(Clone)]
pub struct FuncAction {
    name: String,
    f: Arc<ActionFn>,
}

impl FuncAction {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CancellationToken, &Bindings, &StepProps) -> Result<Execution> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for FuncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncAction").field("name", &self.name).finish()
    }
}

impl Action for FuncAction {
    fn exec(&self, ctx: &CancellationToken, bs: &Bindings, props: &StepProps) -> Result<Execution> {
        (self.f)(ctx, bs, props)
    }
}

// =============================================================================
// Compiled actions
// =============================================================================

/// Declarative action: which interpreter runs what source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSource {
    #[serde(default)]
    pub interpreter: String,
    #[serde(default)]
    pub source: Value,
    /// Binding sets the action may produce. Read by analysis tools only;
    /// execution ignores it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<Bindings>,
}

impl ActionSource {
    pub fn new(interpreter: impl Into<String>, source: Value) -> Self {
        Self {
            interpreter: interpreter.into(),
            source,
            binds: Vec::new(),
        }
    }
}

/// An [`ActionSource`] compiled by its interpreter.
#[derive(Debug, Clone)]
pub struct CompiledAction {
    interpreter: Arc<dyn Interpreter>,
    source: ActionSource,
    compiled: CompiledCode,
}

impl CompiledAction {
    pub fn new(interpreter: Arc<dyn Interpreter>, source: ActionSource, compiled: CompiledCode) -> Self {
        Self {
            interpreter,
            source,
            compiled,
        }
    }

    pub fn source(&self) -> &ActionSource {
        &self.source
    }
}

impl Action for CompiledAction {
    fn exec(&self, ctx: &CancellationToken, bs: &Bindings, props: &StepProps) -> Result<Execution> {
        self.interpreter
            .exec(ctx, bs, props, &self.source.source, &self.compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bs(v: Value) -> Bindings {
        Bindings::from_value(v).unwrap()
    }

    #[test]
    fn test_run_preserves_permanent_bindings() {
        let action = FuncAction::new("reset", |_, _, _| Ok(Execution::with_bindings(Bindings::new())));
        let input = bs(json!({"config!": {"limit": 3}, "count": 2}));
        let exe = run(&action, &CancellationToken::new(), &input, &StepProps::new()).unwrap();
        assert_eq!(
            exe.bindings.unwrap().into_value(),
            json!({"config!": {"limit": 3}})
        );
    }

    #[test]
    fn test_run_refuses_cancelled_context() {
        let action = FuncAction::new("never", |_, _, _| Err(Error::action("should not run")));
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = run(&action, &ctx, &Bindings::new(), &StepProps::new()).unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn test_run_records_trace() {
        let action = FuncAction::new("ping", |_, bs, _| {
            Ok(Execution::with_bindings(bs.clone())
                .emitting(json!({"ping": 1}))
                .emitting(json!({"ping": 2})))
        });
        let exe = run(&action, &CancellationToken::new(), &Bindings::new(), &StepProps::new()).unwrap();
        assert_eq!(exe.events.emitted.len(), 2);
        assert_eq!(exe.events.traces, vec![json!({"action": "executed", "emitted": 2})]);
    }

    #[test]
    fn test_veto_keeps_no_bindings() {
        let action = FuncAction::new("never", |_, _, _| Ok(Execution::veto()));
        let exe = run(&action, &CancellationToken::new(), &bs(json!({"k!": 1})), &StepProps::new()).unwrap();
        assert!(exe.bindings.is_none());
    }

    #[test]
    fn test_errors_propagate() {
        let action = FuncAction::new("boom", |_, _, _| Err(Error::action("boom")));
        let err = run(&action, &CancellationToken::new(), &Bindings::new(), &StepProps::new()).unwrap_err();
        assert_eq!(err.to_string(), "action error: boom");
    }

    #[test]
    fn test_binds_declared_not_applied() {
        let source: ActionSource = serde_json::from_value(json!({
            "interpreter": "noop",
            "binds": [{"?x": 1}, {"?x": 2, "?y": "z"}]
        }))
        .unwrap();
        assert_eq!(source.binds.len(), 2);
        assert_eq!(source.binds[1].get("?y"), Some(&json!("z")));

        let action = InterpreterRegistry::default().compile(&source).unwrap();
        let exe = run(action.as_ref(), &CancellationToken::new(), &bs(json!({"a": 1})), &StepProps::new())
            .unwrap();
        assert_eq!(exe.bindings.unwrap().into_value(), json!({"a": 1}));
    }

    #[test]
    fn test_empty_binds_not_serialized() {
        let v = serde_json::to_value(ActionSource::new("noop", Value::Null)).unwrap();
        assert!(v.get("binds").is_none());
    }
}
