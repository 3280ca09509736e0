pub mod config;
pub mod error;
pub mod handshake;
pub mod layout;
pub mod node;
pub mod persist;
pub mod process;
pub mod reconcile;
pub mod secrets;
pub mod security;
pub mod settings;
pub mod store;

pub use config::AppConfig;
pub use couchkeeper_types::{HandshakePayload, SecretBundle};
pub use error::{AppError, AppResult};
pub use node::{NodeAgent, NodeEvent};
pub use reconcile::{reconcile, ConfigReconciler, DocumentTarget, Entry};
pub use secrets::{ProvisionOutcome, SecretProvisioner};
pub use security::{SecurityState, SecurityStateMachine};
pub use settings::SharedSettings;
pub use store::{ConfigDocument, ConfigStore};
