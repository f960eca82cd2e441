//! Opaque key-agreement and frame-encryption boundary.
//!
//! The connection core treats session-key derivation as a black box: it
//! hands raw handshake bytes across the unencrypted channel and, once both
//! sides report completion, receives an [`EncryptionContext`] it can use to
//! encrypt/decrypt frame bodies. Nothing above this crate needs to know how
//! the keys were derived.
//!
//! This is *not* a UKEY2 implementation. It is a minimal Diffie-Hellman
//! handshake (`x25519-dalek`) that fulfils the same I/O contract
//! (`advance(incoming) -> step`, terminating in a shared [`EncryptionContext`]
//! plus a short human-comparable auth token) so the connection state machine
//! and its tests have something real to drive.

#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(unused_crate_dependencies)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use cipher::EncryptionContext;
pub use error::CryptoError;
pub use handshake::{HandshakeStep, InProcessHandshake, Ukey2Handshake};

mod cipher;
mod error;
mod handshake;

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, CryptoError>;
