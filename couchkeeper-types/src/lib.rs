//! Data types shared between couchkeeper nodes and the peers they talk to.
//!
//! These are the values that cross a process boundary: the credential
//! bundle published through leader settings, and the payload handed to a
//! joining peer over the relation channel.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Cluster-wide credential pair.
///
/// Generated once by the leader and published to every node. The
/// serialized form is `{"admin_pass": "...", "repl_pass": "..."}`.
/// Both fields are wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretBundle {
    /// Password for the `admin` server admin
    pub admin_pass: String,
    /// Password for the `replication` server admin
    pub repl_pass: String,
}

impl SecretBundle {
    pub fn new(admin_pass: impl Into<String>, repl_pass: impl Into<String>) -> Self {
        Self {
            admin_pass: admin_pass.into(),
            repl_pass: repl_pass.into(),
        }
    }
}

impl std::fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBundle")
            .field("admin_pass", &"<redacted>")
            .field("repl_pass", &"<redacted>")
            .finish()
    }
}

/// Values supplied to a peer when it joins the `db` relation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub host: String,
    pub ip: String,
    pub port: u16,
    pub admin_pass: String,
    pub repl_pass: String,
}

impl HandshakePayload {
    /// Flatten into `key=value` pairs in a stable order.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("host", self.host.clone()),
            ("ip", self.ip.clone()),
            ("port", self.port.to_string()),
            ("admin_pass", self.admin_pass.clone()),
            ("repl_pass", self.repl_pass.clone()),
        ]
    }
}

impl std::fmt::Debug for HandshakePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakePayload")
            .field("host", &self.host)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}
