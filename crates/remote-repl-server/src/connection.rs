//! Per-connection protocol engine.
//!
//! Owns one duplex byte stream: a read loop decodes framed messages and
//! dispatches by `op`, a writer task drains the connection's outbound
//! channel, and a subscriber task forwards broadcast events (`out`, `err`,
//! `hit_watch`). Evaluations run on their own tasks and may outlive the
//! request that started them; connection teardown forcibly clears every
//! pending evaluation this connection owns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::{AbortHandle, Abortable};
use remote_repl_engine::{ContextHandle, ExecRequest};
use remote_repl_wire::{Dict, Message, MessageReader, Value, write_message};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

use crate::registry::PendingEvaluation;
use crate::state::ServerState;

/// Source text literal meaning "nothing to evaluate".
const NO_OP_SOURCE: &str = "nil";
/// Marker line rewritten into a suspend-hook invocation by `eval_pause`.
const PAUSE_MARKER: &str = "pause!";
/// Protocol version reported by `describe`.
const PROTOCOL_VERSION: &str = "1";

/// Dispatch state for one accepted connection.
pub struct ConnectionEngine {
    conn_id: u64,
    state: Arc<ServerState>,
    outbound: mpsc::UnboundedSender<Message>,
    default_context: ContextHandle,
    eval_counter: u64,
}

impl ConnectionEngine {
    /// Serve one accepted duplex stream until it closes.
    pub async fn run<S>(state: Arc<ServerState>, stream: S, conn_id: u64)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = write_message(&mut write_half, &msg).await {
                    tracing::debug!(conn_id, "write failed: {e}");
                    break;
                }
            }
        });

        let subscriber = tokio::spawn({
            let outbound = outbound.clone();
            let mut events = state.broadcaster.subscribe();
            async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if outbound.send(event.to_message()).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(conn_id, skipped, "lagged behind broadcast");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        let mut engine = Self {
            conn_id,
            state: Arc::clone(&state),
            outbound,
            default_context: state.engine.new_context(),
            eval_counter: 0,
        };

        let mut reader = MessageReader::new(read_half);
        loop {
            match reader.read_message().await {
                Ok(Some(msg)) => engine.dispatch(msg),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(conn_id, "read failed: {e}");
                    break;
                }
            }
        }

        // teardown: no orphaned evaluation may stay parked on a dead hook
        for entry in state.pending.remove_connection(conn_id) {
            entry.abort.abort();
            if let Some(name) = &entry.hook_name {
                state.engine.remove_hook(name);
            }
        }
        subscriber.abort();
        drop(engine);
        let _ = writer.await;
        tracing::info!(conn_id, "connection closed");
    }

    /// Dispatch one decoded message.
    ///
    /// A request without an `id` gets a generated one first, so every
    /// response for the exchange is addressable.
    fn dispatch(&mut self, mut msg: Message) {
        if msg.id().is_none() {
            let generated = self.next_eval_id();
            msg.set("id", generated);
        }
        tracing::debug!(conn_id = self.conn_id, op = ?msg.op(), id = ?msg.id(), "received");

        let op = msg.op().map(str::to_owned);
        match op.as_deref() {
            Some("clone") => self.register_session(&msg),
            Some("describe") => self.describe(&msg),
            Some("eval") => self.eval_op(msg, false),
            Some("eval_pause") => self.eval_op(msg, true),
            Some("eval_resume") => self.eval_resume(&msg),
            Some("unwatch") => self.unwatch(&msg),
            Some("interrupt") => self.interrupt(&msg),
            other => self.unknown_op(&msg, other),
        }
    }

    fn next_eval_id(&mut self) -> String {
        self.eval_counter += 1;
        format!("eval_{}", self.eval_counter)
    }

    fn send(&self, msg: Message) {
        let _ = self.outbound.send(msg);
    }

    fn fail(&self, msg: &Message, ex: String) {
        self.send(response_for(
            msg,
            Message::new()
                .with("ex", ex)
                .with("status", Value::strings(["done", "error"])),
        ));
    }

    fn register_session(&self, msg: &Message) {
        let session = self.state.sessions.create();
        tracing::debug!(conn_id = self.conn_id, %session, "session registered");
        self.send(response_for(
            msg,
            Message::new()
                .with("new_session", session)
                .with("status", Value::strings(["done"])),
        ));
    }

    fn describe(&self, msg: &Message) {
        let mut versions = Dict::new();
        versions.set("server", env!("CARGO_PKG_VERSION"));
        versions.set("protocol", PROTOCOL_VERSION);
        self.send(response_for(msg, Message::new().with("versions", versions)));
    }

    fn unknown_op(&self, msg: &Message, op: Option<&str>) {
        let label = op.map_or_else(|| "nil".to_owned(), |op| format!("{op:?}"));
        let mut resp = Message::new();
        if let Some(op) = op {
            resp.set("op", op);
        }
        resp.set("status", Value::strings(["done", "error"]));
        resp.set("error", format!("unknown operation: {label}"));
        self.send(response_for(msg, resp));
    }

    /// Schedule an evaluation on its own task (`eval` / `eval_pause`).
    ///
    /// The pending entry is registered before the task can run, so an
    /// interrupt sent a moment later always finds it.
    fn eval_op(&mut self, msg: Message, pausable: bool) {
        let id = msg.id().unwrap_or("unknown").to_owned();
        let session = msg.session().unwrap_or("none").to_owned();

        // prefer a watchpoint's context, then a suspended evaluation's,
        // then this connection's top level
        let context = if let Some(watch_id) = msg.get_str("watch_id") {
            match self.state.watchpoints.get(watch_id) {
                Some(context) => context,
                None => {
                    self.fail(&msg, format!("undefined watch id: {watch_id}"));
                    return;
                }
            }
        } else if let Some(stop_id) = msg.get_str("stop_id") {
            match self.state.pending.suspended_context(stop_id) {
                Some(context) => context,
                None => {
                    self.fail(&msg, format!("undefined stop context: {stop_id}"));
                    return;
                }
            }
        } else {
            self.default_context.clone()
        };

        let mut source = msg.get_str("code").unwrap_or(NO_OP_SOURCE).to_owned();
        if source == NO_OP_SOURCE {
            self.send(response_for(
                &msg,
                Message::new()
                    .with("value", "")
                    .with("status", Value::strings(["done"])),
            ));
            return;
        }

        let mut hook_name = None;
        if pausable {
            let name = self.state.next_hook_name();
            source = rewrite_pause_marker(&source, &name);
            self.state
                .engine
                .install_hook(name.clone(), self.state.suspend_hook());
            hook_name = Some(name);
        }

        let stopped = Arc::new(AtomicBool::new(false));
        let (abort, abort_reg) = AbortHandle::new_pair();
        let entry = PendingEvaluation {
            conn_id: self.conn_id,
            session,
            request_id: id.clone(),
            reply: self.outbound.clone(),
            abort,
            hook_name: hook_name.clone(),
            context: None,
            stopped: Arc::clone(&stopped),
            resume_tx: None,
        };
        if !self.state.pending.register(&id, entry) {
            if let Some(name) = &hook_name {
                self.state.engine.remove_hook(name);
            }
            self.fail(&msg, format!("evaluation already pending: {id}"));
            return;
        }

        let req = ExecRequest {
            eval_id: id.clone(),
            source,
            file: msg.get_str("file").map(ToOwned::to_owned),
            line: msg.get_int("line"),
            context,
        };
        let state = Arc::clone(&self.state);
        let outbound = self.outbound.clone();
        let task = Abortable::new(
            async move {
                match state.engine.execute(req).await {
                    Ok(value) => {
                        // whoever removes the entry owns the terminal
                        // response; after a resume the entry is already gone
                        // and the tail finishes silently
                        if let Some(entry) = state.pending.remove(&id) {
                            if let Some(name) = &entry.hook_name {
                                state.engine.remove_hook(name);
                            }
                            let _ = outbound.send(response_for(
                                &msg,
                                Message::new()
                                    .with("value", value.repr())
                                    .with("status", Value::strings(["done"])),
                            ));
                        }
                    }
                    Err(e) => {
                        let entry = state.pending.remove(&id);
                        if let Some(entry) = &entry {
                            if let Some(name) = &entry.hook_name {
                                state.engine.remove_hook(name);
                            }
                        }
                        // a raise is reported even from a resumed tail; a
                        // missing entry with the stopped flag clear means an
                        // interrupt already delivered the terminal status
                        if entry.is_some() || stopped.load(Ordering::SeqCst) {
                            let _ = outbound.send(response_for(
                                &msg,
                                Message::new()
                                    .with("ex", e.to_string())
                                    .with("status", Value::strings(["done", "error"])),
                            ));
                        }
                    }
                }
            },
            abort_reg,
        );
        tokio::spawn(task);
    }

    /// Unblock a suspended evaluation and clear its registry entry.
    ///
    /// Responds `done` unconditionally: resuming an unknown or
    /// already-resumed `stop_id` is a no-op.
    fn eval_resume(&self, msg: &Message) {
        if let Some(stop_id) = msg.get_str("stop_id") {
            if let Some(mut entry) = self.state.pending.resume(stop_id) {
                if let Some(name) = entry.hook_name.take() {
                    self.state.engine.remove_hook(&name);
                }
                if let Some(tx) = entry.resume_tx.take() {
                    let _ = tx.send(());
                }
                tracing::debug!(conn_id = self.conn_id, stop_id, "evaluation resumed");
            }
        }
        self.send(response_for(
            msg,
            Message::new()
                .with("status", Value::strings(["done"]))
                .with("op", "eval_resume"),
        ));
    }

    fn unwatch(&self, msg: &Message) {
        if let Some(watch_id) = msg.get_str("watch_id") {
            if self.state.watchpoints.remove(watch_id) {
                tracing::debug!(conn_id = self.conn_id, watch_id, "watchpoint removed");
            }
        }
        self.send(response_for(
            msg,
            Message::new()
                .with("op", "unwatch")
                .with("status", Value::strings(["done"])),
        ));
    }

    /// Forcibly kill a pending evaluation. Abrupt: no cleanup runs inside
    /// the evaluated code, and engine state mutated so far stays as-is.
    fn interrupt(&self, msg: &Message) {
        let target = msg
            .get_str("interrupt-id")
            .map(ToOwned::to_owned)
            .or_else(|| self.state.pending.any_id_for_connection(self.conn_id));
        let entry = target.and_then(|id| self.state.pending.remove(&id));

        if let Some(entry) = entry {
            entry.abort.abort();
            if let Some(name) = &entry.hook_name {
                self.state.engine.remove_hook(name);
            }
            tracing::debug!(
                conn_id = self.conn_id,
                id = %entry.request_id,
                "evaluation interrupted"
            );
            self.send(response_for(
                msg,
                Message::new()
                    .with("status", Value::strings(["done", "interrupted"]))
                    .with("op", "interrupt"),
            ));
        } else {
            self.send(response_for(
                msg,
                Message::new()
                    .with("status", Value::strings(["done"]))
                    .with("op", "interrupt"),
            ));
        }
    }
}

/// Echo `session` and `id` from the request, with the protocol's fallbacks.
fn response_for(req: &Message, mut resp: Message) -> Message {
    resp.set("session", req.session().unwrap_or("none"));
    resp.set("id", req.id().unwrap_or("unknown"));
    resp
}

/// Rewrite every line holding the pause marker into an invocation of the
/// evaluation's uniquely named suspend hook. Line numbers are preserved so
/// suspension call sites report correctly.
fn rewrite_pause_marker(source: &str, hook_name: &str) -> String {
    source
        .split('\n')
        .map(|line| {
            if line.trim() == PAUSE_MARKER {
                let indent = &line[..line.len() - line.trim_start().len()];
                format!("{indent}suspend!(\"{hook_name}\")")
            } else {
                line.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::pump_engine_events;

    #[test]
    fn rewrites_marker_lines_only() {
        let source = "x = 1\n  pause!\ny = \"pause!\"\npause!";
        let rewritten = rewrite_pause_marker(source, "stop_1_ab");
        assert_eq!(
            rewritten,
            "x = 1\n  suspend!(\"stop_1_ab\")\ny = \"pause!\"\nsuspend!(\"stop_1_ab\")"
        );
    }

    #[test]
    fn rewrite_preserves_line_count() {
        let source = "a = 1\npause!\na + 1";
        let rewritten = rewrite_pause_marker(source, "h");
        assert_eq!(source.lines().count(), rewritten.lines().count());
    }

    #[test]
    fn response_echoes_request_addressing() {
        let req = Message::of("eval").with("id", "e9").with("session", "s1");
        let resp = response_for(&req, Message::new().with("value", "1"));
        assert_eq!(resp.id(), Some("e9"));
        assert_eq!(resp.session(), Some("s1"));

        let bare = response_for(&Message::new(), Message::new());
        assert_eq!(bare.id(), Some("unknown"));
        assert_eq!(bare.session(), Some("none"));
    }

    #[tokio::test]
    async fn evaluates_code_over_an_in_memory_stream() {
        let (state, events) = ServerState::with_script_engine();
        tokio::spawn(pump_engine_events(Arc::clone(&state), events));

        let (client_io, server_io) = tokio::io::duplex(4096);
        tokio::spawn(ConnectionEngine::run(state, server_io, 1));

        let (read_half, mut write_half) = tokio::io::split(client_io);
        let mut reader = MessageReader::new(read_half);
        write_message(
            &mut write_half,
            &Message::of("eval")
                .with("code", "1 + 2")
                .with("id", "some_id"),
        )
        .await
        .unwrap();

        let resp = reader.read_message().await.unwrap().unwrap();
        assert_eq!(resp.id(), Some("some_id"));
        assert_eq!(resp.session(), Some("none"));
        assert_eq!(resp.get_str("value"), Some("3"));
        assert_eq!(resp.status(), Some(vec!["done"]));
    }
}
