//! Execution engine abstraction and built-in script interpreter.
//!
//! The server core never interprets source text itself: it hands an
//! [`ExecRequest`] to an [`ExecutionEngine`] and converts the outcome into a
//! protocol response. The engine can suspend an evaluation mid-execution by
//! awaiting an installed [`SuspendHook`], and can raise [`EngineEvent`]s
//! (watch hits) without blocking the running code.
//!
//! [`script::ScriptEngine`] is the built-in implementation: a small
//! newline-separated statement language with assignable variables, so the
//! whole protocol is runnable and testable end to end.

pub mod env;
pub mod script;
pub mod value;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

pub use env::{ContextHandle, Environment};
pub use script::ScriptEngine;
pub use value::Value;

/// Engine failure. Everything is reported as a human-readable message that
/// the server surfaces in the response's `ex` field.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Eval(String),
}

/// One evaluation request handed to the engine.
///
/// `eval_id` is the correlation token for the evaluation unit driving this
/// call: the engine threads it into every [`SuspendPoint`], so a suspend hook
/// can resolve the owning pending evaluation without ambient task-local
/// state, even with many pausable evaluations in flight.
#[derive(Clone)]
pub struct ExecRequest {
    pub eval_id: String,
    pub source: String,
    /// Origin file reported at suspension call sites. Defaults to `EVAL`.
    pub file: Option<String>,
    /// Source line of the first line of `source`. Defaults to 0.
    pub line: Option<i64>,
    /// Lexical context to execute against.
    pub context: ContextHandle,
}

/// Where and on whose behalf an evaluation suspended.
#[derive(Clone)]
pub struct SuspendPoint {
    /// Id of the evaluation unit that invoked the hook.
    pub eval_id: String,
    /// The lexical context at the suspension site.
    pub context: ContextHandle,
    /// Call-site file, captured at the moment of suspension.
    pub file: String,
    /// Call-site line, captured at the moment of suspension.
    pub line: i64,
}

/// Future returned by a suspend hook; the evaluation blocks until it
/// resolves.
pub type SuspendFuture = BoxFuture<'static, ()>;

/// An ephemeral, uniquely named callback installed for one pausable
/// evaluation. Invoked from within running code; awaiting the returned
/// future is what suspends the evaluation.
pub type SuspendHook = Arc<dyn Fn(SuspendPoint) -> SuspendFuture + Send + Sync>;

/// Asynchronous event raised by the engine while code is running.
#[derive(Clone)]
pub enum EngineEvent {
    /// Running code invoked the watch primitive. The code does not block;
    /// the receiver is expected to persist the context under a watch id.
    WatchHit {
        context: ContextHandle,
        file: String,
        line: i64,
    },
}

/// Destination for output produced by running code.
///
/// Injected into the engine so output redirection is explicit rather than a
/// mutated process global.
pub trait OutputSink: Send + Sync {
    fn write_out(&self, text: &str);
    fn write_err(&self, text: &str);
}

/// The execution engine collaborator consumed by the server core.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Execute source against a context, returning the terminal value.
    ///
    /// # Errors
    /// Returns `EngineError` if the source fails to parse or evaluation
    /// raises.
    async fn execute(&self, req: ExecRequest) -> Result<Value, EngineError>;

    /// Create a fresh top-level context.
    fn new_context(&self) -> ContextHandle;

    /// Register a suspend hook under a (process-wide unique) name.
    fn install_hook(&self, name: String, hook: SuspendHook);

    /// Unregister a suspend hook. Unknown names are ignored.
    fn remove_hook(&self, name: &str);
}
