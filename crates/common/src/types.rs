//! Core entity types for wgmint
//!
//! All three entities carry SQLite-assigned integer identifiers. The
//! identifier doubles as the ordinal used for address derivation, so it is
//! never reused.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// A managed WireGuard interface with its own address block and keypair.
///
/// The interface itself is recreated every process lifetime; only the record
/// is durable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub comment: String,
    pub ipv4_base: Ipv4Addr,
    pub ipv6_base: Ipv6Addr,
    pub private_key: String,
    pub public_key: String,
    pub listen_port: u16,
}

/// An authorization principal owning a quota of peers, identified by an
/// opaque code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub code: String,
    pub peers_max: i64,
    pub created_at: i64,
    pub valid_until: i64,
    pub comment: String,
}

impl Account {
    /// Expiry comparison; both sides are UTC epoch seconds.
    pub fn is_expired(&self, now: i64) -> bool {
        self.valid_until < now
    }

    /// Display form of the code, e.g. `L7V.2BC.MM3.PRK.VF2`.
    pub fn formatted_code(&self) -> String {
        self.code
            .as_bytes()
            .chunks(3)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// A registered remote endpoint, owned by one Account and placed on one
/// Device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: i64,
    pub account_id: i64,
    pub public_key: String,
    pub device_id: i64,
}
