//! The signed policy envelope and its inner structures.
//!
//! An envelope wraps opaque policy bytes with a signature and optional
//! key-change fields. The inner `PolicyData` is only decoded for the
//! named fields the daemon acts on; `policy_value` stays opaque except
//! for device scope, where it carries [`DeviceSettings`].

use prost::Message;

/// The policy type string required for device-scope policy.
pub const DEVICE_POLICY_TYPE: &str = "google/chromeos/device";

/// Signed wrapper around policy bytes.
#[derive(Clone, PartialEq, Message)]
pub struct PolicyEnvelope {
    /// Serialized [`PolicyData`].
    #[prost(bytes = "vec", optional, tag = "1")]
    pub policy_data: Option<Vec<u8>>,

    /// Signature over `policy_data` under the effective key.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub policy_data_signature: Option<Vec<u8>>,

    /// Replacement public key, present on install/rotate/clobber.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub new_public_key: Option<Vec<u8>>,

    /// Rotation proof: signature over `new_public_key` under the
    /// previous key.
    #[prost(bytes = "vec", optional, tag = "4")]
    pub new_public_key_signature: Option<Vec<u8>>,
}

impl PolicyEnvelope {
    /// Decodes an envelope from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns the prost decode error for malformed bytes.
    pub fn parse(blob: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(blob)
    }

    /// Serializes the envelope to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// True if the envelope carries no fields at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Decodes the inner [`PolicyData`], if present and well-formed.
    #[must_use]
    pub fn decode_data(&self) -> Option<PolicyData> {
        let bytes = self.policy_data.as_deref()?;
        PolicyData::decode(bytes).ok()
    }
}

/// Inner policy structure; the daemon reads only these named fields.
#[derive(Clone, PartialEq, Message)]
pub struct PolicyData {
    /// Scope discriminator; `google/chromeos/device` for device policy.
    #[prost(string, optional, tag = "1")]
    pub policy_type: Option<String>,

    /// Canonical email of the policy's subject (the owner, for device
    /// scope).
    #[prost(string, optional, tag = "2")]
    pub username: Option<String>,

    /// Presence indicates enterprise enrollment.
    #[prost(string, optional, tag = "3")]
    pub request_token: Option<String>,

    /// Opaque settings payload; [`DeviceSettings`] for device scope.
    #[prost(bytes = "vec", optional, tag = "4")]
    pub policy_value: Option<Vec<u8>>,

    /// Set when the device needs serial-number recovery.
    #[prost(bool, optional, tag = "5")]
    pub valid_serial_number_missing: Option<bool>,
}

impl PolicyData {
    /// Serializes to bytes suitable for `PolicyEnvelope::policy_data`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// True if this policy marks the device as enterprise-enrolled.
    #[must_use]
    pub fn is_enterprise(&self) -> bool {
        self.request_token.is_some()
    }

    /// Decodes the settings payload, if present and well-formed.
    #[must_use]
    pub fn decode_settings(&self) -> Option<DeviceSettings> {
        let bytes = self.policy_value.as_deref()?;
        DeviceSettings::decode(bytes).ok()
    }
}

/// Device-scope settings the daemon acts on.
#[derive(Clone, PartialEq, Message)]
pub struct DeviceSettings {
    /// Users allowed to sign in; ordered, owner included.
    #[prost(string, repeated, tag = "1")]
    pub user_whitelist: Vec<String>,

    /// Tri-state: unset, explicitly true, or explicitly false.
    #[prost(bool, optional, tag = "2")]
    pub allow_new_users: Option<bool>,

    /// Flags handed to the browser on start-up.
    #[prost(string, repeated, tag = "3")]
    pub start_up_flags: Vec<String>,

    /// Configured device-local account ids.
    #[prost(string, repeated, tag = "4")]
    pub device_local_accounts: Vec<String>,
}

impl DeviceSettings {
    /// Serializes to bytes suitable for `PolicyData::policy_value`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}
