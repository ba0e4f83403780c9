//! Transport filter: the encrypted-channel layer an authenticated session
//! may install over a connection.
//!
//! The auth handshake negotiates *whether* one is installed, not how every
//! byte on the wire gets wrapped. This module is a small trait capturing the
//! drain/shutdown/encrypt/decrypt contract the connection state machine
//! needs, with a no-op passthrough and a real TLS-backed implementation
//! behind it. Connection logic never matches on which one is installed.

use std::io::{Cursor, Read, Write};

use crate::error::ConnectionError;

/// A transport wrapper installed over a connection's raw byte stream.
pub trait Filter: Send {
    /// Returns `true` once both directions are empty: no plaintext queued
    /// for encryption and no ciphertext awaiting transmission. A filter
    /// swap is only safe once this holds.
    fn drain(&mut self) -> bool;

    /// Whether the peer's shutdown (close-notify) has been observed.
    fn is_shutdown_received(&self) -> bool;

    /// Starts this side's shutdown handshake.
    fn shutdown(&mut self);

    /// Wraps outbound plaintext for transmission.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ConnectionError>;

    /// Unwraps inbound ciphertext into plaintext.
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ConnectionError>;
}

/// Cleartext passthrough, installed on every connection until (and unless)
/// auth negotiates something stronger.
#[derive(Debug, Default)]
pub struct NullFilter;

impl Filter for NullFilter {
    fn drain(&mut self) -> bool {
        true
    }

    fn is_shutdown_received(&self) -> bool {
        true
    }

    fn shutdown(&mut self) {}

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        Ok(ciphertext.to_vec())
    }
}

/// A `rustls`-backed filter, installed when auth negotiates TLS material.
pub struct RustlsFilter {
    conn: rustls::ServerConnection,
    peer_closed: bool,
}

impl RustlsFilter {
    #[must_use]
    pub const fn new(conn: rustls::ServerConnection) -> Self {
        Self { conn, peer_closed: false }
    }
}

impl Filter for RustlsFilter {
    fn drain(&mut self) -> bool {
        !self.conn.wants_write() && !self.conn.wants_read()
    }

    fn is_shutdown_received(&self) -> bool {
        self.peer_closed
    }

    fn shutdown(&mut self) {
        self.conn.send_close_notify();
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.conn.writer().write_all(plaintext)?;
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out)?;
        }
        Ok(out)
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let mut cursor = Cursor::new(ciphertext);
        while (cursor.position() as usize) < ciphertext.len() {
            self.conn.read_tls(&mut cursor)?;
        }
        let state = self
            .conn
            .process_new_packets()
            .map_err(|err| ConnectionError::AuthenticationFailed(err.to_string()))?;
        self.peer_closed = state.peer_has_closed();

        let mut out = Vec::new();
        self.conn.reader().read_to_end(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_filter_is_a_passthrough() {
        let mut filter = NullFilter;
        assert!(filter.drain());
        assert!(filter.is_shutdown_received());
        assert_eq!(filter.encrypt(b"hello").unwrap(), b"hello");
        assert_eq!(filter.decrypt(b"hello").unwrap(), b"hello");
    }
}
