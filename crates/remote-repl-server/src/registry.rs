//! Shared, mutex-guarded registries: sessions, pending evaluations, and
//! watchpoints.
//!
//! All three are shared across every connection and every evaluation task;
//! each read-modify-write happens under the registry's lock. Claiming an
//! entry (interrupt, resume, normal completion) removes it under the lock,
//! so exactly one party ever owns an evaluation's terminal response.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::AbortHandle;
use remote_repl_engine::ContextHandle;
use remote_repl_wire::Message;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Opaque session tokens handed out by `clone`.
///
/// Sessions carry no state beyond existence; they are correlation handles
/// echoed back on responses and are never explicitly destroyed.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashSet<String>>,
}

impl SessionRegistry {
    /// Allocate a new session token.
    pub fn create(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.sessions.lock().unwrap().insert(id.clone());
        id
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().contains(id)
    }
}

/// One in-flight or suspended evaluation unit.
pub struct PendingEvaluation {
    /// Connection that started the evaluation (scopes teardown).
    pub conn_id: u64,
    /// Session echoed on every response for this evaluation.
    pub session: String,
    /// Request id echoed on every response for this evaluation.
    pub request_id: String,
    /// Outbound channel of the owning connection.
    pub reply: mpsc::UnboundedSender<Message>,
    /// Kills the evaluation task, effective at its next suspension point.
    pub abort: AbortHandle,
    /// Suspend hook installed for this evaluation, if it is pausable.
    pub hook_name: Option<String>,
    /// Context captured at the suspension site, once suspended.
    pub context: Option<ContextHandle>,
    /// Set at suspension; suppresses the terminal `done` after resume.
    pub stopped: Arc<AtomicBool>,
    /// Unblocks the suspended task; consumed by `eval_resume`.
    pub resume_tx: Option<oneshot::Sender<()>>,
}

/// Registry of in-flight evaluations, keyed by evaluation id.
#[derive(Default)]
pub struct PendingEvals {
    inner: Mutex<HashMap<String, PendingEvaluation>>,
}

impl PendingEvals {
    /// Register an evaluation before its task starts.
    ///
    /// Returns `false` (leaving the registry untouched) if the id is already
    /// live: at most one pending evaluation may exist per id.
    #[must_use]
    pub fn register(&self, id: &str, entry: PendingEvaluation) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(id) {
            return false;
        }
        inner.insert(id.to_owned(), entry);
        true
    }

    /// Claim an evaluation: remove and return its entry.
    pub fn remove(&self, id: &str) -> Option<PendingEvaluation> {
        self.inner.lock().unwrap().remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(id)
    }

    /// The context captured by a suspended evaluation, if `id` names one.
    #[must_use]
    pub fn suspended_context(&self, id: &str) -> Option<ContextHandle> {
        self.inner
            .lock()
            .unwrap()
            .get(id)
            .and_then(|entry| entry.context.clone())
    }

    /// Record a suspension: store the captured context, mark the evaluation
    /// stopped, and install the resume channel.
    ///
    /// Returns the addressing needed for the `paused` notification, or
    /// `None` if the evaluation is no longer registered (e.g. interrupted
    /// between scheduling and suspension).
    pub fn suspend(
        &self,
        id: &str,
        context: ContextHandle,
        resume_tx: oneshot::Sender<()>,
    ) -> Option<(mpsc::UnboundedSender<Message>, String, String)> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.get_mut(id)?;
        entry.context = Some(context);
        entry.stopped.store(true, Ordering::SeqCst);
        entry.resume_tx = Some(resume_tx);
        Some((
            entry.reply.clone(),
            entry.session.clone(),
            entry.request_id.clone(),
        ))
    }

    /// Claim a suspended evaluation for resumption.
    ///
    /// Only entries that actually hold a resume channel are claimed; a
    /// resume racing ahead of the suspension is a no-op.
    pub fn resume(&self, id: &str) -> Option<PendingEvaluation> {
        let mut inner = self.inner.lock().unwrap();
        if inner.get(id)?.resume_tx.is_some() {
            inner.remove(id)
        } else {
            None
        }
    }

    /// An arbitrary live evaluation id owned by `conn_id`.
    ///
    /// Target selection for an `interrupt` without an explicit id is
    /// implementation-defined; callers must not rely on ordering.
    #[must_use]
    pub fn any_id_for_connection(&self, conn_id: u64) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|(_, entry)| entry.conn_id == conn_id)
            .map(|(id, _)| id.clone())
    }

    /// Claim every evaluation owned by a closed connection.
    pub fn remove_connection(&self, conn_id: u64) -> Vec<PendingEvaluation> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<String> = inner
            .iter()
            .filter(|(_, entry)| entry.conn_id == conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter().filter_map(|id| inner.remove(&id)).collect()
    }
}

/// Durable bindings from watch ids to persisted contexts.
///
/// Created by running code (never by a client request), survive the
/// connection that created them, and die only by explicit `unwatch`.
#[derive(Default)]
pub struct Watchpoints {
    inner: Mutex<HashMap<String, ContextHandle>>,
}

impl Watchpoints {
    /// Persist a context under a fresh watch id.
    pub fn register(&self, context: ContextHandle) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.inner.lock().unwrap().insert(id.clone(), context);
        id
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ContextHandle> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    /// Delete a watchpoint. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.inner.lock().unwrap().remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(conn_id: u64) -> PendingEvaluation {
        let (reply, _rx) = mpsc::unbounded_channel();
        let (abort, _reg) = AbortHandle::new_pair();
        PendingEvaluation {
            conn_id,
            session: "none".into(),
            request_id: "e1".into(),
            reply,
            abort,
            hook_name: None,
            context: None,
            stopped: Arc::new(AtomicBool::new(false)),
            resume_tx: None,
        }
    }

    #[test]
    fn register_rejects_live_duplicates() {
        let pending = PendingEvals::default();
        assert!(pending.register("e1", entry(1)));
        assert!(!pending.register("e1", entry(1)));
        assert!(pending.remove("e1").is_some());
        assert!(pending.register("e1", entry(1)));
    }

    #[test]
    fn suspend_then_resume_claims_the_entry() {
        let pending = PendingEvals::default();
        assert!(pending.register("e1", entry(7)));

        // not yet suspended: resume is a no-op
        assert!(pending.resume("e1").is_none());
        assert!(pending.contains("e1"));

        let ctx = ContextHandle::root();
        let (tx, _rx) = oneshot::channel();
        let addressing = pending.suspend("e1", ctx.clone(), tx);
        assert!(addressing.is_some());
        assert!(pending.suspended_context("e1").is_some());

        let claimed = pending.resume("e1").unwrap();
        assert!(claimed.resume_tx.is_some());
        assert!(claimed.stopped.load(Ordering::SeqCst));
        assert!(!pending.contains("e1"));
        assert!(pending.resume("e1").is_none());
    }

    #[test]
    fn suspend_of_unregistered_evaluation_is_none() {
        let pending = PendingEvals::default();
        let (tx, _rx) = oneshot::channel();
        assert!(pending.suspend("ghost", ContextHandle::root(), tx).is_none());
    }

    #[test]
    fn teardown_claims_only_the_connections_entries() {
        let pending = PendingEvals::default();
        assert!(pending.register("a", entry(1)));
        assert!(pending.register("b", entry(2)));
        assert!(pending.register("c", entry(1)));

        let removed = pending.remove_connection(1);
        assert_eq!(removed.len(), 2);
        assert!(!pending.contains("a"));
        assert!(pending.contains("b"));
        assert!(pending.any_id_for_connection(1).is_none());
        assert_eq!(pending.any_id_for_connection(2).as_deref(), Some("b"));
    }

    #[test]
    fn watchpoints_round_trip() {
        let watchpoints = Watchpoints::default();
        let ctx = ContextHandle::root();
        let id = watchpoints.register(ctx.clone());

        assert!(watchpoints.get(&id).unwrap().same_as(&ctx));
        assert!(watchpoints.remove(&id));
        assert!(!watchpoints.remove(&id));
        assert!(watchpoints.get(&id).is_none());
    }

    #[test]
    fn sessions_are_unique() {
        let sessions = SessionRegistry::default();
        let a = sessions.create();
        let b = sessions.create();
        assert_ne!(a, b);
        assert!(sessions.contains(&a));
        assert!(sessions.contains(&b));
        assert!(!sessions.contains("nope"));
    }
}
