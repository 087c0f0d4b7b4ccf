//! Async client for the remote-repl protocol.
//!
//! Wraps one TCP connection: outgoing requests get auto-assigned ids and the
//! current session token, incoming messages are decoded off the stream.
//! Unsolicited messages (`out`/`err` output, `hit_watch` broadcasts, paused
//! notifications) arrive interleaved with responses; [`Client::recv`] hands
//! them all back in order, [`Client::recv_response`] waits for a specific
//! response id.

use remote_repl_wire::{Message, MessageReader, WireError, write_message};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("evaluation failed: {0}")]
    Eval(String),
    #[error("unexpected response: {0:?}")]
    Unexpected(Message),
}

/// One protocol connection.
pub struct Client {
    reader: MessageReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
    session: Option<String>,
}

impl Client {
    /// Connect to a server.
    ///
    /// # Errors
    /// Returns error if the TCP connection fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: MessageReader::new(read_half),
            writer: write_half,
            next_id: 0,
            session: None,
        })
    }

    /// The adopted session token, once [`Self::register_session`] has run.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Send a message exactly as given.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn send_raw(&mut self, msg: &Message) -> Result<(), ClientError> {
        write_message(&mut self.writer, msg).await?;
        Ok(())
    }

    /// Send a message, assigning the next request id (unless one is already
    /// set) and attaching the current session. Returns the id used.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn send(&mut self, mut msg: Message) -> Result<String, ClientError> {
        let id = match msg.id() {
            Some(id) => id.to_owned(),
            None => {
                self.next_id += 1;
                let id = self.next_id.to_string();
                msg.set("id", id.as_str());
                id
            }
        };
        if msg.session().is_none() {
            if let Some(session) = &self.session {
                msg.set("session", session.as_str());
            }
        }
        self.send_raw(&msg).await?;
        Ok(id)
    }

    /// Receive the next message: responses and unsolicited notifications
    /// alike, in arrival order.
    ///
    /// # Errors
    /// Returns `ClientError::Closed` if the server hung up.
    pub async fn recv(&mut self) -> Result<Message, ClientError> {
        self.reader
            .read_message()
            .await?
            .ok_or(ClientError::Closed)
    }

    /// Receive messages until one answers the given request id, discarding
    /// everything else (broadcasts, other evaluations' responses).
    ///
    /// # Errors
    /// Returns error if the read fails or the connection closes first.
    pub async fn recv_response(&mut self, id: &str) -> Result<Message, ClientError> {
        loop {
            let msg = self.recv().await?;
            if msg.op() != Some("hit_watch") && msg.id() == Some(id) {
                return Ok(msg);
            }
        }
    }

    /// Drive `clone` and adopt the returned session for later requests.
    ///
    /// # Errors
    /// Returns error if the exchange fails or no session comes back.
    pub async fn register_session(&mut self) -> Result<String, ClientError> {
        let id = self.send(Message::of("clone")).await?;
        let resp = self.recv_response(&id).await?;
        match resp.get_str("new_session") {
            Some(session) if session != "none" => {
                self.session = Some(session.to_owned());
                Ok(session.to_owned())
            }
            _ => Err(ClientError::Unexpected(resp)),
        }
    }

    /// Evaluate code, returning the stringified value.
    ///
    /// # Errors
    /// Returns `ClientError::Eval` if the server reports an evaluation
    /// failure.
    pub async fn eval(&mut self, code: &str) -> Result<String, ClientError> {
        let id = self.send(Message::of("eval").with("code", code)).await?;
        let resp = self.recv_response(&id).await?;
        if let Some(value) = resp.get_str("value") {
            return Ok(value.to_owned());
        }
        if let Some(ex) = resp.get_str("ex") {
            return Err(ClientError::Eval(ex.to_owned()));
        }
        Err(ClientError::Unexpected(resp))
    }
}
