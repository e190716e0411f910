//! Trust manifest structure and assembly
//!
//! The manifest is the document relying parties pin against: per-host
//! certificate fingerprints and public keys, tagged with the customer and the
//! time it was built. The signature covers the exact bytes returned by
//! [`Manifest::to_bytes`].

pub mod cache;
pub mod domains;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::certificate::CertificateIdentity;
use crate::error::SignerError;

pub use domains::DomainEntry;

/// Offset applied in far-future test mode: twenty 365-day years
pub const FAR_FUTURE_OFFSET_SECS: i64 = 60 * 60 * 24 * 365 * 20;

/// How the manifest timestamp is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampMode {
    /// Wall-clock time of building
    #[default]
    Normal,
    /// Wall-clock time plus 20 years. Only for exercising long-lived
    /// signature handling in relying parties, never for production pins.
    FarFutureTest,
}

impl TimestampMode {
    /// Unix timestamp to embed for a manifest built at `now`
    pub fn timestamp_at(self, now: DateTime<Utc>) -> i64 {
        match self {
            TimestampMode::Normal => now.timestamp(),
            TimestampMode::FarFutureTest => now.timestamp() + FAR_FUTURE_OFFSET_SECS,
        }
    }
}

/// Pins for one `hostname:port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub hostname: String,

    /// Serialized as a decimal string for compatibility with existing clients
    #[serde(with = "port_string")]
    pub port: u16,

    /// Lowercase hex SHA-256 certificate fingerprints
    #[serde(rename = "fp")]
    pub fingerprints: Vec<String>,

    /// Base64 DER SubjectPublicKeyInfo, parallel to `fingerprints`
    #[serde(rename = "pk")]
    pub public_keys: Vec<String>,
}

impl HostRecord {
    /// Record for a host presenting a single certificate
    pub fn from_identity(hostname: &str, port: u16, identity: CertificateIdentity) -> Self {
        HostRecord {
            hostname: hostname.to_string(),
            port,
            fingerprints: vec![identity.fingerprint],
            public_keys: vec![identity.public_key],
        }
    }

    /// Pairs of (fingerprint, public key)
    pub fn identities(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fingerprints
            .iter()
            .map(String::as_str)
            .zip(self.public_keys.iter().map(String::as_str))
    }

    /// Check the record invariants
    pub fn validate(&self) -> Result<(), String> {
        if self.hostname.trim().is_empty() {
            return Err("host record without hostname".to_string());
        }
        if self.port == 0 {
            return Err(format!("{}: port 0", self.hostname));
        }
        if self.fingerprints.is_empty() {
            return Err(format!("{}:{} has no fingerprints", self.hostname, self.port));
        }
        if self.fingerprints.len() != self.public_keys.len() {
            return Err(format!(
                "{}:{} has {} fingerprints but {} public keys",
                self.hostname,
                self.port,
                self.fingerprints.len(),
                self.public_keys.len()
            ));
        }
        if let Some(bad) = self
            .fingerprints
            .iter()
            .find(|fp| fp.len() != 64 || !fp.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')))
        {
            return Err(format!(
                "{}:{} has non-canonical fingerprint {:?}",
                self.hostname, self.port, bad
            ));
        }
        Ok(())
    }
}

/// The unsigned manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub customer: String,
    pub hashes: Vec<HostRecord>,
    /// Unix seconds
    pub timestamp: i64,
}

/// Assemble a manifest stamped with the current time
pub fn build(customer: &str, hashes: Vec<HostRecord>, mode: TimestampMode) -> Manifest {
    build_at(customer, hashes, mode, Utc::now())
}

/// Assemble a manifest with an explicit clock
pub fn build_at(
    customer: &str,
    hashes: Vec<HostRecord>,
    mode: TimestampMode,
    now: DateTime<Utc>,
) -> Manifest {
    Manifest {
        customer: customer.to_string(),
        hashes,
        timestamp: mode.timestamp_at(now),
    }
}

impl Manifest {
    /// Compact JSON with fields in declaration order; these are the signed bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, SignerError> {
        serde_json::to_vec(self).map_err(|source| SignerError::Serialization { source })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Timestamp as a date, if representable
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    /// Pins for a host, if present
    pub fn host(&self, hostname: &str, port: u16) -> Option<&HostRecord> {
        self.hashes
            .iter()
            .find(|record| record.port == port && record.hostname.eq_ignore_ascii_case(hostname))
    }
}

mod port_string {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&port.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawPort {
            Number(u16),
            Text(String),
        }

        let port = match RawPort::deserialize(deserializer)? {
            RawPort::Number(port) => port,
            RawPort::Text(text) => text
                .trim()
                .parse::<u16>()
                .map_err(|e| D::Error::custom(format!("invalid port {text:?}: {e}")))?,
        };

        if port == 0 {
            return Err(D::Error::custom("port must be between 1 and 65535"));
        }
        Ok(port)
    }
}
