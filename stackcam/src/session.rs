//! Per-connection state.
//!
//! A session is in one of two modes. In command mode, lines from the client
//! are dispatched. After a successful `IMAGE` the session switches to
//! streaming mode and holds the encoded image and a send cursor; no input is
//! dispatched until every byte has been written, after which it returns to
//! command mode.

use std::net::SocketAddr;

/// Host name recorded when the peer address does not resolve.
pub const UNKNOWN_HOSTNAME: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Command,
    Streaming,
}

/// A snapshot of a session, as listed by the server.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub hostname: String,
    pub remote_addr: SocketAddr,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub mode: SessionMode,
    pub bytes_sent: usize,
    pub bytes_total: usize,
}

#[derive(Debug)]
pub struct ClientSession {
    id: u64,
    hostname: String,
    remote_addr: SocketAddr,
    connected_at: chrono::DateTime<chrono::Utc>,
    mode: SessionMode,
    payload: Vec<u8>,
    cursor: usize,
    close_requested: bool,
}

impl ClientSession {
    pub fn new(id: u64, remote_addr: SocketAddr, hostname: String) -> Self {
        Self {
            id,
            hostname,
            remote_addr,
            connected_at: chrono::Utc::now(),
            mode: SessionMode::Command,
            payload: Vec::new(),
            cursor: 0,
            close_requested: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Input may be dispatched only in command mode.
    pub fn accepts_commands(&self) -> bool {
        self.mode == SessionMode::Command && !self.close_requested
    }

    /// Switch to streaming mode with `payload` to send. Returns its length.
    pub fn begin_streaming(&mut self, payload: Vec<u8>) -> usize {
        self.payload = payload;
        self.cursor = 0;
        self.mode = SessionMode::Streaming;
        self.payload.len()
    }

    /// The next bytes to send, at most `max_len` of them.
    ///
    /// An empty slice means everything was sent; call
    /// [Self::finish_streaming].
    pub fn pending_chunk(&self, max_len: usize) -> &[u8] {
        if self.mode != SessionMode::Streaming {
            return &[];
        }
        let end = self.payload.len().min(self.cursor + max_len);
        &self.payload[self.cursor..end]
    }

    /// Record that `n` bytes of the pending chunk were written.
    pub fn advance(&mut self, n: usize) {
        self.cursor = self.payload.len().min(self.cursor + n);
    }

    /// Return to command mode once the payload was sent completely.
    ///
    /// Returns `false`, leaving the session streaming, while bytes remain.
    pub fn finish_streaming(&mut self) -> bool {
        if self.mode == SessionMode::Streaming && self.cursor < self.payload.len() {
            return false;
        }
        self.mode = SessionMode::Command;
        self.payload = Vec::new();
        self.cursor = 0;
        true
    }

    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            hostname: self.hostname.clone(),
            remote_addr: self.remote_addr,
            connected_at: self.connected_at,
            mode: self.mode,
            bytes_sent: self.cursor,
            bytes_total: self.payload.len(),
        }
    }
}
