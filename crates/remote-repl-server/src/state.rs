//! Process-wide shared state, injected into every connection by reference.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use remote_repl_engine::{EngineEvent, ExecutionEngine, ScriptEngine, SuspendHook, SuspendPoint};
use remote_repl_wire::{Message, Value};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::broadcast::{BroadcastSink, Broadcaster, ServerEvent};
use crate::registry::{PendingEvals, SessionRegistry, Watchpoints};

/// Registries, engine, and fan-out shared by all connections.
pub struct ServerState {
    pub engine: Arc<dyn ExecutionEngine>,
    pub sessions: SessionRegistry,
    pub pending: PendingEvals,
    pub watchpoints: Watchpoints,
    pub broadcaster: Broadcaster,
    hook_counter: AtomicU64,
}

impl ServerState {
    /// Build state around an execution engine and a broadcaster.
    #[must_use]
    pub fn new(engine: Arc<dyn ExecutionEngine>, broadcaster: Broadcaster) -> Self {
        Self {
            engine,
            sessions: SessionRegistry::default(),
            pending: PendingEvals::default(),
            watchpoints: Watchpoints::default(),
            broadcaster,
            hook_counter: AtomicU64::new(0),
        }
    }

    /// Wire up the built-in script engine with output fan-out.
    ///
    /// Returns the state plus the engine event stream; callers must drive
    /// the events through [`pump_engine_events`].
    #[must_use]
    pub fn with_script_engine() -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let broadcaster = Broadcaster::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(BroadcastSink::new(broadcaster.clone()));
        let engine = Arc::new(ScriptEngine::new(sink, events_tx));
        (Arc::new(Self::new(engine, broadcaster)), events_rx)
    }

    /// Process-wide unique suspend-hook name: monotonic counter plus a
    /// random salt.
    pub fn next_hook_name(&self) -> String {
        let n = self.hook_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("stop_{n}_{}", Uuid::new_v4().simple())
    }

    /// The suspend-hook callback shared by every pausable evaluation.
    ///
    /// The suspend point's `eval_id` identifies the owning pending
    /// evaluation, so concurrent pausable evaluations never cross-talk. On
    /// invocation: record the captured context, mark the entry stopped, send
    /// exactly one `done,paused` notification to the owning connection, and
    /// park the evaluation until `eval_resume` fires the resume channel.
    #[must_use]
    pub fn suspend_hook(self: &Arc<Self>) -> SuspendHook {
        let state = Arc::clone(self);
        Arc::new(move |point: SuspendPoint| {
            let state = Arc::clone(&state);
            Box::pin(async move {
                let (resume_tx, resume_rx) = oneshot::channel();
                let Some((reply, session, request_id)) =
                    state
                        .pending
                        .suspend(&point.eval_id, point.context, resume_tx)
                else {
                    tracing::warn!(
                        eval_id = %point.eval_id,
                        "suspension from an unregistered evaluation"
                    );
                    return;
                };
                tracing::debug!(
                    eval_id = %point.eval_id,
                    file = %point.file,
                    line = point.line,
                    "evaluation paused"
                );
                let paused = Message::new()
                    .with("session", session)
                    .with("id", request_id)
                    .with("file", point.file)
                    .with("line", point.line)
                    .with("status", Value::strings(["done", "paused"]));
                let _ = reply.send(paused);
                let _ = resume_rx.await;
            })
        })
    }
}

/// Drain engine events.
///
/// Each watch hit persists the captured context under a fresh watch id and
/// broadcasts `hit_watch` to every connection - not just the one whose
/// evaluation created it - so observers can discover watch ids without
/// out-of-band coordination.
pub async fn pump_engine_events(
    state: Arc<ServerState>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::WatchHit {
                context,
                file,
                line,
            } => {
                let watch_id = state.watchpoints.register(context);
                tracing::info!(%watch_id, %file, line, "watchpoint created");
                state.broadcaster.publish(ServerEvent::WatchHit {
                    watch_id,
                    file,
                    line,
                });
            }
        }
    }
}
