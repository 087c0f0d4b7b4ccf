//! Bencode wire codec and message model for the remote-repl protocol.
//!
//! Provides:
//! - `Value` / `Dict` - self-delimiting nested value model (order-preserving)
//! - `Message` - one protocol message (a dictionary keyed by `op`, `id`, ...)
//! - `decode` / `encode` - incremental stream codec over byte buffers
//! - `MessageReader` / `write_message` - async adapters for tokio streams

pub mod codec;
pub mod message;
pub mod value;

pub use codec::{MessageReader, WireError, decode, encode, write_message};
pub use message::Message;
pub use value::{Dict, Value};
