use clap::{Parser, Subcommand};
use couchkeeper::{
    config::{AppConfig, SettingsBackend},
    handshake::RelationSetChannel,
    process::SystemProcessControl,
    settings::{FileSettings, LeaderToolSettings},
    ConfigStore, NodeAgent, NodeEvent, SecretProvisioner, SharedSettings,
};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "couchkeeper")]
#[command(about = "Secures a clustered CouchDB node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a lifecycle hook (install, start, stop, leader-elected,
    /// leader-settings-changed, db-relation-joined)
    Hook {
        name: String,
        /// Relation id for relation hooks
        #[arg(long)]
        relation: Option<String>,
    },
    /// Print a managed config document
    Show { name: String },
    /// Put a config document back from its .bak copy
    Restore { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "couchkeeper=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command {
        Commands::Hook { name, relation } => run_hook(&config, &name, relation.as_deref()).await,
        Commands::Show { name } => {
            let store = ConfigStore::new(&config.couchdb.config_dir);
            match store.load(&name)? {
                Some(document) => {
                    print!("{}", document.render());
                    Ok(())
                }
                None => anyhow::bail!("{} does not exist", store.document_path(&name).display()),
            }
        }
        Commands::Restore { name } => {
            let store = ConfigStore::new(&config.couchdb.config_dir);
            let path = store.restore(&name)?;
            info!("Restored {} from backup", path.display());
            Ok(())
        }
    }
}

async fn run_hook(config: &AppConfig, hook: &str, relation: Option<&str>) -> anyhow::Result<()> {
    let event = NodeEvent::from_hook(hook, relation)
        .ok_or_else(|| anyhow::anyhow!("Unknown hook '{}'", hook))?;

    let settings: Arc<dyn SharedSettings> = match config.node.settings_backend {
        SettingsBackend::LeaderTools => Arc::new(LeaderToolSettings::new()),
        SettingsBackend::File => {
            let settings = FileSettings::new(config.node.settings_path(), config.node.is_leader);
            debug!("Using single-host settings at {}", settings.path().display());
            Arc::new(settings)
        }
    };
    let mut node = NodeAgent::resume(
        config.couchdb.clone(),
        SecretProvisioner::new(settings),
        Arc::new(SystemProcessControl),
        Arc::new(RelationSetChannel),
        config.node.flags_path(),
    )
    .await?;

    node.handle(event).await?;
    info!(
        "Hook {} complete; security state {:?}",
        hook,
        node.security_state()
    );
    Ok(())
}
