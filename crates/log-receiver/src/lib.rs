//! Server-side endpoint of a transaction-log replication channel.
//!
//! A primary node streams committed metadata operations as framed log
//! blocks carrying sequence numbers and checksums; this crate accepts
//! those blocks over authenticated TCP connections, validates them, hands
//! them to a log writer for persistence, replays the confirmed operations
//! into an in-memory state machine, and returns acknowledgements carrying
//! the durability frontier.
//!
//! Module map, leaves first:
//!
//! - [`checksum`] — the composable block checksum (C2).
//! - [`framed`] — splits inbound bytes into RPC frames and block bodies (C1).
//! - [`block`] — validates a complete block body: sequence, checksum, line
//!   framing (C4).
//! - [`filter`] — the transport filter trait an authenticated session may
//!   install.
//! - [`auth`] — the `AUTHENTICATE` handshake and per-connection session
//!   state machine (C3).
//! - [`connection`] — the per-connection receive state machine (C5).
//! - [`writer`] — the log writer collaborator and its file-backed
//!   implementation (C9).
//! - [`replay`] — the replay engine collaborator and its sequence-tracking
//!   implementation (C10).
//! - [`receiver`] — the receiver-wide frontier, queues, and dispatcher
//!   (C6/C7).
//! - [`reactor`] — the mio poll loop tying every connection to the
//!   receiver core (C8).
//! - [`config`] — process configuration (C0).
//! - [`error`] — the connection-local and startup error taxonomies.

pub mod auth;
pub mod block;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod framed;
pub mod reactor;
pub mod receiver;
pub mod replay;
pub mod writer;
