//! Pausable remote code-evaluation protocol server.
//!
//! Clients connect over TCP and exchange bencode-framed messages (see
//! `remote-repl-wire`). The core of this crate is the evaluation session
//! protocol: concurrent evaluations that can voluntarily suspend and be
//! resumed from a later request, named watchpoints persisting a lexical
//! context indefinitely, forcible interrupts, and process-wide output
//! fan-out to every connected client.
//!
//! Provides:
//! - `Server` - listener, accept loop, lifecycle
//! - `ServerState` - shared registries injected into every connection
//! - `ConnectionEngine` - per-connection read loop and dispatch
//! - `Broadcaster` / `BroadcastSink` - output and watch-hit fan-out

pub mod broadcast;
pub mod connection;
pub mod registry;
pub mod server;
pub mod state;

pub use broadcast::{BroadcastSink, Broadcaster, ServerEvent};
pub use connection::ConnectionEngine;
pub use registry::{PendingEvals, PendingEvaluation, SessionRegistry, Watchpoints};
pub use server::{Server, ServerError};
pub use state::{ServerState, pump_engine_events};

/// Default listen host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default listen port.
pub const DEFAULT_PORT: u16 = 7888;
/// Marker file recording the bound port, written at startup.
pub const PORT_FILENAME: &str = ".repl-port";
