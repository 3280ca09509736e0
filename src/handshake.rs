//! Credentials handed to peers joining the `db` relation.

use crate::config::CouchConfig;
use crate::error::{AppError, AppResult};
use couchkeeper_types::{HandshakePayload, SecretBundle};
use std::process::Command;

pub trait HandshakeChannel: Send + Sync {
    fn send(&self, relation: &str, payload: &HandshakePayload) -> AppResult<()>;
}

pub fn build_payload(couch: &CouchConfig, bundle: &SecretBundle) -> HandshakePayload {
    HandshakePayload {
        host: couch.host.clone(),
        ip: couch.ip.clone(),
        port: couch.port,
        admin_pass: bundle.admin_pass.clone(),
        repl_pass: bundle.repl_pass.clone(),
    }
}

/// Publishes the payload with the `relation-set` hook tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelationSetChannel;

impl HandshakeChannel for RelationSetChannel {
    fn send(&self, relation: &str, payload: &HandshakePayload) -> AppResult<()> {
        let mut command = Command::new("relation-set");
        if !relation.is_empty() {
            command.args(["-r", relation]);
        }
        for (key, value) in payload.to_pairs() {
            command.arg(format!("{key}={value}"));
        }

        let status = command
            .status()
            .map_err(|e| AppError::Handshake(format!("relation-set: {e}")))?;
        if !status.success() {
            return Err(AppError::Handshake(format!("relation-set exited with {status}")));
        }
        Ok(())
    }
}
