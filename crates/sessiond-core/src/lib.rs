//! sessiond-core - ownership and policy core of the sessiond daemon.
//!
//! This library holds everything below the session state machine: the
//! device owner-key lifecycle, the signed policy services for the
//! device, per-user, and device-local-account scopes, key-loss
//! mitigation, the opaque keystore seam, and the validation and file
//! I/O primitives they share.
//!
//! # Modules
//!
//! - [`owner_key`]: the owner's public key with its on-disk lifecycle
//! - [`policy`]: envelopes, stores, and the three policy services
//! - [`mitigator`]: owner-key loss mitigation
//! - [`crypto`]: signing primitives and the keystore abstraction
//! - [`events`]: session states and the signal vocabulary
//! - [`error`]: the stable wire error kinds
//! - [`validate`]: email, user-hash, and argv validation
//! - [`fs_safe`]: atomic, bounded file I/O

pub mod crypto;
pub mod error;
pub mod events;
pub mod fs_safe;
pub mod mitigator;
pub mod owner_key;
pub mod policy;
pub mod validate;

pub use error::SessionError;
pub use events::{SessionState, Signal, SignalEmitter};
