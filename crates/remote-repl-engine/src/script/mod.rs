//! Built-in script engine.
//!
//! A deliberately small statement language (assignments, arithmetic,
//! comparisons, `print`/`println`) over shared [`ContextHandle`]s, plus the
//! two protocol primitives: `suspend!("<hook>")` blocks the evaluation on an
//! installed hook, and `watch!` raises a watch event without blocking.

mod exec;
mod parse;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::env::ContextHandle;
use crate::value::Value;
use crate::{
    EngineError, EngineEvent, ExecRequest, ExecutionEngine, OutputSink, SuspendHook, SuspendPoint,
};
use exec::Evaluator;
use parse::{Stmt, parse};

/// Origin file reported when a request carries none.
const DEFAULT_FILE: &str = "EVAL";

/// The built-in [`ExecutionEngine`].
pub struct ScriptEngine {
    hooks: Mutex<HashMap<String, SuspendHook>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    sink: Arc<dyn OutputSink>,
}

impl ScriptEngine {
    /// Create an engine writing code output to `sink` and raising
    /// [`EngineEvent`]s on `events`.
    #[must_use]
    pub fn new(sink: Arc<dyn OutputSink>, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            hooks: Mutex::new(HashMap::new()),
            events,
            sink,
        }
    }
}

#[async_trait]
impl ExecutionEngine for ScriptEngine {
    async fn execute(&self, req: ExecRequest) -> Result<Value, EngineError> {
        let file = req.file.as_deref().unwrap_or(DEFAULT_FILE);
        let base = req.line.unwrap_or(0);
        let program = parse(&req.source, base)?;
        tracing::debug!(eval_id = %req.eval_id, statements = program.stmts.len(), "executing");

        let eval = Evaluator {
            ctx: &req.context,
            sink: self.sink.as_ref(),
        };
        let mut last = Value::Nil;
        for stmt in &program.stmts {
            match stmt {
                Stmt::Assign {
                    name, op, expr, ..
                } => {
                    last = eval.assign(name, *op, expr)?;
                }
                Stmt::Expr { expr, .. } => {
                    last = eval.eval(expr)?;
                }
                Stmt::Watch { line } => {
                    let _ = self.events.send(EngineEvent::WatchHit {
                        context: req.context.clone(),
                        file: file.to_owned(),
                        line: base + *line as i64,
                    });
                    last = Value::Nil;
                }
                Stmt::Suspend { hook, line } => {
                    let Some(hook_fn) = self.hooks.lock().unwrap().get(hook).cloned() else {
                        return Err(EngineError::Eval(format!(
                            "undefined suspend hook: {hook}"
                        )));
                    };
                    hook_fn(SuspendPoint {
                        eval_id: req.eval_id.clone(),
                        context: req.context.clone(),
                        file: file.to_owned(),
                        line: base + *line as i64,
                    })
                    .await;
                    last = Value::Nil;
                }
            }
        }
        Ok(last)
    }

    fn new_context(&self) -> ContextHandle {
        ContextHandle::root()
    }

    fn install_hook(&self, name: String, hook: SuspendHook) {
        self.hooks.lock().unwrap().insert(name, hook);
    }

    fn remove_hook(&self, name: &str) {
        self.hooks.lock().unwrap().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    impl OutputSink for NullSink {
        fn write_out(&self, _: &str) {}
        fn write_err(&self, _: &str) {}
    }

    #[derive(Default)]
    struct CaptureSink(Mutex<String>);

    impl OutputSink for CaptureSink {
        fn write_out(&self, text: &str) {
            self.0.lock().unwrap().push_str(text);
        }
        fn write_err(&self, text: &str) {
            self.0.lock().unwrap().push_str(text);
        }
    }

    fn test_engine() -> (ScriptEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ScriptEngine::new(Arc::new(NullSink), tx), rx)
    }

    async fn run(engine: &ScriptEngine, ctx: &ContextHandle, source: &str) -> Result<Value, EngineError> {
        engine
            .execute(ExecRequest {
                eval_id: "t".into(),
                source: source.into(),
                file: None,
                line: None,
                context: ctx.clone(),
            })
            .await
    }

    #[tokio::test]
    async fn evaluates_last_statement() {
        let (engine, _events) = test_engine();
        let ctx = engine.new_context();
        assert_eq!(
            run(&engine, &ctx, "x = 20\nx + 1").await.unwrap(),
            Value::Int(21)
        );
        assert_eq!(
            run(&engine, &ctx, "\"a\" + \"b\"").await.unwrap(),
            Value::Str("ab".into())
        );
        assert_eq!(
            run(&engine, &ctx, "x == 20").await.unwrap(),
            Value::Bool(true)
        );
        assert_eq!(run(&engine, &ctx, "nil").await.unwrap(), Value::Nil);
        assert_eq!(run(&engine, &ctx, "7 % 3").await.unwrap(), Value::Int(1));
        assert_eq!(run(&engine, &ctx, "-(2 * 3)").await.unwrap(), Value::Int(-6));
    }

    #[tokio::test]
    async fn context_persists_across_executions() {
        let (engine, _events) = test_engine();
        let ctx = engine.new_context();
        run(&engine, &ctx, "counter = 1").await.unwrap();
        run(&engine, &ctx, "counter += 10").await.unwrap();
        assert_eq!(
            run(&engine, &ctx, "counter").await.unwrap(),
            Value::Int(11)
        );
    }

    #[tokio::test]
    async fn error_messages() {
        let (engine, _events) = test_engine();
        let ctx = engine.new_context();
        assert_eq!(
            run(&engine, &ctx, "missing").await.unwrap_err().to_string(),
            "undefined variable: missing"
        );
        assert_eq!(
            run(&engine, &ctx, "1 / 0").await.unwrap_err().to_string(),
            "division by zero"
        );
        assert_eq!(
            run(&engine, &ctx, "pause!").await.unwrap_err().to_string(),
            "undefined function: pause!"
        );
        assert_eq!(
            run(&engine, &ctx, "1 + \"a\"").await.unwrap_err().to_string(),
            "unsupported operand types for +: int and string"
        );
    }

    #[tokio::test]
    async fn println_writes_through_the_sink() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = Arc::new(CaptureSink::default());
        let engine = ScriptEngine::new(sink.clone(), tx);
        let ctx = engine.new_context();
        run(&engine, &ctx, "println(\"hello \" + \"world\")")
            .await
            .unwrap();
        assert_eq!(*sink.0.lock().unwrap(), "hello world\n");
    }

    #[tokio::test]
    async fn watch_emits_event_and_does_not_block() {
        let (engine, mut events) = test_engine();
        let ctx = engine.new_context();
        let value = run(&engine, &ctx, "v = 40\nwatch!\nv + 2").await.unwrap();
        assert_eq!(value, Value::Int(42));

        let EngineEvent::WatchHit {
            context,
            file,
            line,
        } = events.try_recv().unwrap();
        assert_eq!(file, "EVAL");
        assert_eq!(line, 1);
        assert_eq!(context.get("v"), Some(Value::Int(40)));

        // the captured handle is a live window onto the same bindings
        context.set("v", Value::Int(99));
        assert_eq!(ctx.get("v"), Some(Value::Int(99)));
    }

    #[tokio::test]
    async fn suspend_blocks_until_hook_resolves() {
        let (engine, _events) = test_engine();
        let engine = Arc::new(engine);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<(String, String, i64)>();

        let release_rx = Mutex::new(Some(release_rx));
        let seen_tx = Mutex::new(Some(seen_tx));
        engine.install_hook(
            "h1".into(),
            Arc::new(move |point: SuspendPoint| {
                let release_rx = release_rx.lock().unwrap().take();
                let seen_tx = seen_tx.lock().unwrap().take();
                Box::pin(async move {
                    if let Some(tx) = seen_tx {
                        let _ = tx.send((point.eval_id, point.file, point.line));
                    }
                    if let Some(rx) = release_rx {
                        let _ = rx.await;
                    }
                })
            }),
        );

        let ctx = engine.new_context();
        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            let ctx = ctx.clone();
            async move {
                engine
                    .execute(ExecRequest {
                        eval_id: "e1".into(),
                        source: "x = 1\nsuspend!(\"h1\")\nx + 1".into(),
                        file: Some("/tmp/some_file".into()),
                        line: Some(20),
                        context: ctx,
                    })
                    .await
            }
        });

        let (eval_id, file, line) = seen_rx.await.unwrap();
        assert_eq!(eval_id, "e1");
        assert_eq!(file, "/tmp/some_file");
        assert_eq!(line, 21);
        assert!(!task.is_finished());
        assert_eq!(ctx.get("x"), Some(Value::Int(1)));

        release_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), Value::Int(2));
    }

    #[tokio::test]
    async fn unknown_hook_is_an_eval_error() {
        let (engine, _events) = test_engine();
        let ctx = engine.new_context();
        assert_eq!(
            run(&engine, &ctx, "suspend!(\"nope\")")
                .await
                .unwrap_err()
                .to_string(),
            "undefined suspend hook: nope"
        );
    }
}
