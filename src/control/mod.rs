//! Encrypted binary control protocol.
//!
//! An alternative provisioning path to the HTTP API: a client sends one
//! sealed fixed-size frame asking the server to map a port back to the
//! client's address (`update`) or to drop that mapping (`delete`). The server
//! answers `acknowledge` or `error-no-tunnel`.
//!
//! - [`message`] — 37-byte wire layout
//! - [`cipher`] — ChaCha20-Poly1305 sealing
//! - [`provisioner`] — what a mapping turns into (broker tunnel or helper process)
//! - [`server`] — [`server::ControlService`]
//! - [`client`] — request sender used by `ip6tun notify`

pub mod cipher;
pub mod client;
pub mod message;
pub mod provisioner;
pub mod server;

pub use cipher::ControlCipher;
pub use message::{ClientId, ControlMessage, MessageType};
pub use provisioner::{BrokerProvisioner, HelperProvisioner, Mapping, Provisioner};
pub use server::{ControlService, ControlSettings};
