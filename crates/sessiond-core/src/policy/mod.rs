//! Policy envelopes, stores, and the per-scope services.
//!
//! Three scopes share the verify/store/persist behavior of
//! [`service::PolicyService`] with different key-change rules:
//!
//! - [`device`]: the device scope; owns the owner key, admits rotation
//!   and (before any session) install/clobber.
//! - [`user`]: one service per signed-in user; first store installs the
//!   user key, later stores need rotation proof.
//! - [`device_local`]: kiosk-style accounts; owner-key signatures only,
//!   never a key change.

pub mod device;
pub mod device_local;
pub mod envelope;
pub mod service;
pub mod store;
pub mod user;

pub use device::DevicePolicyService;
pub use device_local::DeviceLocalAccountPolicyService;
pub use envelope::{DeviceSettings, PolicyData, PolicyEnvelope, DEVICE_POLICY_TYPE};
pub use service::{KeyFlags, Persister, PolicyService, StoreCompletion};
pub use store::PolicyStore;
pub use user::UserPolicyServiceFactory;
