//! A session-oriented variant of TFTP carried over TCP.
//!
//! Clients log in with a username, then upload, download, list and delete files in the server's
//! storage directory. Transfers move in 512-byte blocks, each acknowledged before the next is
//! sent. Uploads and deletes are announced to every logged-in client.
//!
//! - [`tftp`] defines the packets and their wire encoding.
//! - [`decoder`] finds message boundaries in the byte stream.
//! - [`processor`] is the per-connection server state machine.
//! - [`registry`] tracks live connections and logins for addressed sends and broadcasts.
//! - [`srv_conn`] accepts connections and runs one thread per connection.
//! - [`client`] is the client state machine and interactive session.

pub mod cli;
pub mod client;
pub mod decoder;
pub mod processor;
pub mod registry;
pub mod srv_conn;
pub mod storage;
pub mod tftp;
