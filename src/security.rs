//! Per-node open → secured state machine.
//!
//! A node starts in admin party (`Open`). Once the cluster bundle is
//! available it moves to `Transitioning`, writes the secured config, asks
//! for a restart and settles in `Secured`, which is terminal.

use crate::config::CouchConfig;
use crate::error::AppResult;
use crate::layout::{self, ADMINS_SECTION, ADMIN_USER, AUTH_SECTION, LOCAL_DOCUMENT};
use crate::reconcile::ConfigReconciler;
use crate::secrets::{read_bundle, SecretProvisioner};
use crate::store::ConfigDocument;
use couchkeeper_types::SecretBundle;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityState {
    /// Admin party: no authentication required
    Open,
    /// Bundle available, secured config not yet committed
    Transitioning,
    /// Secured config committed and restart requested
    Secured,
}

/// What the node has observed when deciding its next state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    pub bundle_available: bool,
    pub reconciled: bool,
}

impl SecurityState {
    /// Pure transition function. Never moves backwards.
    pub fn next(self, observed: Observation) -> Self {
        match self {
            Self::Open if observed.bundle_available => Self::Transitioning,
            Self::Open => Self::Open,
            Self::Transitioning if observed.reconciled => Self::Secured,
            Self::Transitioning => Self::Transitioning,
            Self::Secured => Self::Secured,
        }
    }

    /// Reconstruct the state of a node from what is already on disk.
    pub fn derive(bundle: Option<&SecretBundle>, local: Option<&ConfigDocument>) -> Self {
        let Some(bundle) = bundle else {
            return Self::Open;
        };
        let secured = local.is_some_and(|doc| {
            doc.get(ADMINS_SECTION, ADMIN_USER) == Some(bundle.admin_pass.as_str())
                && doc.get(AUTH_SECTION, "require_valid_user") == Some("true")
        });
        if secured {
            Self::Secured
        } else {
            Self::Transitioning
        }
    }
}

/// What woke the state machine up. Used for logging only; every trigger is
/// handled the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    SettingsChanged,
    LeadershipChanged,
}

/// Side effects for the process-control collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    RestartService,
}

#[derive(Debug)]
pub struct SecurityStateMachine {
    state: SecurityState,
    provisioner: SecretProvisioner,
    reconciler: ConfigReconciler,
    couch: CouchConfig,
}

impl SecurityStateMachine {
    /// Start in `Open`.
    pub fn new(provisioner: SecretProvisioner, couch: CouchConfig) -> Self {
        Self::with_state(provisioner, couch, SecurityState::Open)
    }

    pub fn with_state(
        provisioner: SecretProvisioner,
        couch: CouchConfig,
        state: SecurityState,
    ) -> Self {
        let reconciler = ConfigReconciler::new(&couch.config_dir);
        Self {
            state,
            provisioner,
            reconciler,
            couch,
        }
    }

    /// Start from the state implied by the published bundle and `local.ini`.
    pub async fn resume(provisioner: SecretProvisioner, couch: CouchConfig) -> AppResult<Self> {
        let bundle = read_bundle(provisioner.settings().as_ref()).await?;
        let reconciler = ConfigReconciler::new(&couch.config_dir);
        let local = match reconciler.store().load(LOCAL_DOCUMENT) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Cannot read {} document: {}", LOCAL_DOCUMENT, e);
                None
            }
        };
        let state = SecurityState::derive(bundle.as_ref(), local.as_ref());
        debug!("Resuming in state {:?}", state);
        Ok(Self::with_state(provisioner, couch, state))
    }

    pub fn state(&self) -> SecurityState {
        self.state
    }

    fn advance(&mut self, observed: Observation) {
        let next = self.state.next(observed);
        if next != self.state {
            info!("Security state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Run one step for `trigger`.
    ///
    /// Returns the effects to carry out. A reconcile failure leaves the node
    /// in `Transitioning` so the next trigger retries; a secret generation
    /// failure leaves it in `Open`.
    pub async fn handle(&mut self, trigger: Trigger) -> AppResult<Vec<Effect>> {
        if self.state == SecurityState::Secured {
            debug!("Ignoring {:?}: already secured", trigger);
            return Ok(Vec::new());
        }

        let outcome = self.provisioner.ensure_provisioned().await?;
        let Some(bundle) = outcome.bundle() else {
            debug!("No cluster passwords yet; staying in admin party");
            return Ok(Vec::new());
        };
        self.advance(Observation {
            bundle_available: true,
            reconciled: false,
        });

        info!("Ending the admin party");
        let targets = layout::secured_documents(bundle, &self.couch);
        self.reconciler.reconcile(&targets).into_result()?;

        self.advance(Observation {
            bundle_available: true,
            reconciled: true,
        });
        Ok(vec![Effect::RestartService])
    }
}
