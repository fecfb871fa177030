//! Interpreters compile action sources into executable handles.
//!
//! The registry is an ordinary value handed to spec compilation; there is no
//! process-wide default.

use super::{Action, ActionSource, CompiledAction, Execution, FuncAction, StepProps};
use crate::matcher::Bindings;
use crate::types::{Error, Result};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Opaque compiled form of an action source. Only the interpreter that
/// produced it knows its concrete type.
pub type CompiledCode = Arc<dyn Any + Send + Sync>;

/// A compile/execute back end for action sources.
pub trait Interpreter: Send + Sync + fmt::Debug {
    fn compile(&self, source: &Value) -> Result<CompiledCode>;

    fn exec(
        &self,
        ctx: &CancellationToken,
        bs: &Bindings,
        props: &StepProps,
        source: &Value,
        compiled: &CompiledCode,
    ) -> Result<Execution>;
}

// =============================================================================
// Built-in interpreters
// =============================================================================

/// Returns bindings unchanged and emits nothing.
#[derive(Debug, Default)]
pub struct NoopInterpreter;

impl Interpreter for NoopInterpreter {
    fn compile(&self, _source: &Value) -> Result<CompiledCode> {
        Ok(Arc::new(()))
    }

    fn exec(
        &self,
        _ctx: &CancellationToken,
        bs: &Bindings,
        _props: &StepProps,
        _source: &Value,
        _compiled: &CompiledCode,
    ) -> Result<Execution> {
        Ok(Execution::with_bindings(bs.clone()))
    }
}

/// Resolves sources naming registered native functions.
///
/// A source is either the function name as a string or `{"name": "..."}`.
#[derive(Debug, Default)]
pub struct NativeInterpreter {
    funcs: HashMap<String, FuncAction>,
}

impl NativeInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, func: FuncAction) -> Self {
        self.funcs.insert(func.name().to_string(), func);
        self
    }

    fn function_name(source: &Value) -> Result<&str> {
        match source {
            Value::String(s) => Ok(s),
            Value::Object(m) => m
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::compile("native source needs a \"name\"")),
            other => Err(Error::compile(format!("bad native source: {}", other))),
        }
    }
}

impl Interpreter for NativeInterpreter {
    fn compile(&self, source: &Value) -> Result<CompiledCode> {
        let name = Self::function_name(source)?;
        let func = self
            .funcs
            .get(name)
            .ok_or_else(|| Error::compile(format!("no native function '{}'", name)))?;
        Ok(Arc::new(func.clone()))
    }

    fn exec(
        &self,
        ctx: &CancellationToken,
        bs: &Bindings,
        props: &StepProps,
        _source: &Value,
        compiled: &CompiledCode,
    ) -> Result<Execution> {
        let func = compiled
            .downcast_ref::<FuncAction>()
            .ok_or_else(|| Error::internal("native interpreter given foreign compiled code"))?;
        func.exec(ctx, bs, props)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Name-keyed interpreters.
#[derive(Debug, Clone)]
pub struct InterpreterRegistry {
    interpreters: HashMap<String, Arc<dyn Interpreter>>,
}

impl InterpreterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            interpreters: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, interpreter: Arc<dyn Interpreter>) {
        self.interpreters.insert(name.into(), interpreter);
    }

    pub fn with(mut self, name: impl Into<String>, interpreter: Arc<dyn Interpreter>) -> Self {
        self.register(name, interpreter);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Interpreter>> {
        self.interpreters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InterpreterNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.interpreters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Compile `source` with the interpreter it names.
    pub fn compile(&self, source: &ActionSource) -> Result<Arc<dyn Action>> {
        let interpreter = self.get(&source.interpreter)?;
        let compiled = interpreter.compile(&source.source)?;
        Ok(Arc::new(CompiledAction::new(interpreter, source.clone(), compiled)))
    }
}

impl Default for InterpreterRegistry {
    /// A registry holding only the `noop` interpreter.
    fn default() -> Self {
        Self::new().with("noop", Arc::new(NoopInterpreter))
    }
}
