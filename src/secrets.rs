//! Cluster-wide credential provisioning.
//!
//! The leader generates the [`SecretBundle`] the first time provisioning
//! runs and publishes it under [`PASSWORDS_KEY`]. Every other call, on any
//! node, only reads it back.

use crate::error::{AppError, AppResult};
use crate::settings::{SharedSettings, WriteOutcome};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use couchkeeper_types::SecretBundle;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Settings key holding the serialized bundle
pub const PASSWORDS_KEY: &str = "passwords";

/// Random bytes per password (192 bits)
pub const PASSWORD_BYTES: usize = 24;

/// Source of randomness for password generation.
pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> AppResult<()>;
}

/// The operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) -> AppResult<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| AppError::SecretGeneration(e.to_string()))
    }
}

/// Generate one printable password from `PASSWORD_BYTES` of entropy.
pub fn generate_password(entropy: &dyn EntropySource) -> AppResult<String> {
    let mut bytes = [0u8; PASSWORD_BYTES];
    entropy.fill(&mut bytes)?;
    let password = URL_SAFE_NO_PAD.encode(bytes);
    bytes.zeroize();
    Ok(password)
}

/// Generate an admin/replication pair from independent draws.
pub fn generate_bundle(entropy: &dyn EntropySource) -> AppResult<SecretBundle> {
    let admin_pass = generate_password(entropy)?;
    let repl_pass = generate_password(entropy)?;
    Ok(SecretBundle::new(admin_pass, repl_pass))
}

/// Read the published bundle, if any.
pub async fn read_bundle(settings: &dyn SharedSettings) -> AppResult<Option<SecretBundle>> {
    match settings.get(PASSWORDS_KEY).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Result of one provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// A bundle was already published; nothing was generated
    AlreadyProvisioned(SecretBundle),
    /// This node generated and published the bundle
    Generated(SecretBundle),
    /// This node generated a bundle but another leader's write won
    AdoptedConcurrent(SecretBundle),
    /// No bundle yet and this node may not create one
    NotLeader,
}

impl ProvisionOutcome {
    pub fn bundle(&self) -> Option<&SecretBundle> {
        match self {
            Self::AlreadyProvisioned(b) | Self::Generated(b) | Self::AdoptedConcurrent(b) => {
                Some(b)
            }
            Self::NotLeader => None,
        }
    }

    pub fn into_bundle(self) -> Option<SecretBundle> {
        match self {
            Self::AlreadyProvisioned(b) | Self::Generated(b) | Self::AdoptedConcurrent(b) => {
                Some(b)
            }
            Self::NotLeader => None,
        }
    }
}

/// Ensures exactly one bundle is ever published for the cluster.
#[derive(Clone)]
pub struct SecretProvisioner {
    settings: Arc<dyn SharedSettings>,
    entropy: Arc<dyn EntropySource>,
}

impl SecretProvisioner {
    pub fn new(settings: Arc<dyn SharedSettings>) -> Self {
        Self::with_entropy(settings, Arc::new(OsEntropy))
    }

    pub fn with_entropy(settings: Arc<dyn SharedSettings>, entropy: Arc<dyn EntropySource>) -> Self {
        Self { settings, entropy }
    }

    pub fn settings(&self) -> &Arc<dyn SharedSettings> {
        &self.settings
    }

    /// Idempotent; safe to call on every leadership or settings event.
    ///
    /// Entropy failures are returned as `SecretGeneration` and never retried.
    /// Losing a write to another leader is not an error: the winning bundle
    /// is read back and adopted.
    pub async fn ensure_provisioned(&self) -> AppResult<ProvisionOutcome> {
        if let Some(bundle) = read_bundle(self.settings.as_ref()).await? {
            debug!("Passwords already provisioned");
            return Ok(ProvisionOutcome::AlreadyProvisioned(bundle));
        }

        if !self.settings.is_leader().await {
            debug!("Passwords not provisioned yet; waiting for the leader");
            return Ok(ProvisionOutcome::NotLeader);
        }

        let bundle = generate_bundle(self.entropy.as_ref())?;
        let mut json = serde_json::to_string(&bundle)?;
        let written = self.settings.set_if_absent(PASSWORDS_KEY, &json).await;
        json.zeroize();

        match written {
            Ok(WriteOutcome::Written) => {
                info!("Generated and published cluster passwords");
                Ok(ProvisionOutcome::Generated(bundle))
            }
            Ok(WriteOutcome::Existing(winner)) => {
                warn!("Lost stale bundle race; adopting the published passwords");
                let winner: SecretBundle = serde_json::from_str(&winner)?;
                Ok(ProvisionOutcome::AdoptedConcurrent(winner))
            }
            Err(AppError::NotLeader { .. }) => {
                // Leadership moved between the check and the write
                match read_bundle(self.settings.as_ref()).await? {
                    Some(winner) => {
                        warn!("Lost leadership while provisioning; adopting the published passwords");
                        Ok(ProvisionOutcome::AdoptedConcurrent(winner))
                    }
                    None => {
                        debug!("Lost leadership before passwords were published");
                        Ok(ProvisionOutcome::NotLeader)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for SecretProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretProvisioner").finish_non_exhaustive()
    }
}
