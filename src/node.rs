//! Node agent: turns lifecycle events into provisioning, reconciliation and
//! service-control actions.
//!
//! Events are handled one at a time, to completion. Every handler is safe to
//! re-run, so a failed event is simply retried by the next one.

use crate::config::CouchConfig;
use crate::error::{AppError, AppResult};
use crate::handshake::{build_payload, HandshakeChannel};
use crate::layout;
use crate::persist::{read_json_or_default, write_json_pretty};
use crate::process::ProcessControl;
use crate::reconcile::ConfigReconciler;
use crate::secrets::{read_bundle, SecretProvisioner};
use crate::security::{Effect, SecurityState, SecurityStateMachine, Trigger};
use crate::settings::{ClusterEvent, NodeId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Install,
    Start,
    Stop,
    LeadershipChanged { is_leader: bool },
    SettingsChanged,
    PeerJoined { relation: String },
}

impl NodeEvent {
    /// Map a hook name to the event it delivers.
    pub fn from_hook(hook: &str, relation: Option<&str>) -> Option<Self> {
        match hook {
            "install" => Some(Self::Install),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "leader-elected" => Some(Self::LeadershipChanged { is_leader: true }),
            "leader-settings-changed" => Some(Self::SettingsChanged),
            "db-relation-joined" => Some(Self::PeerJoined {
                relation: relation.unwrap_or_default().to_string(),
            }),
            _ => None,
        }
    }
}

/// Local lifecycle flags, persisted between hook invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    pub installed: bool,
    /// Config changed since the service was last (re)started
    pub restart_pending: bool,
    pub running: bool,
}

pub struct NodeAgent {
    couch: CouchConfig,
    provisioner: SecretProvisioner,
    machine: SecurityStateMachine,
    reconciler: ConfigReconciler,
    process: Arc<dyn ProcessControl>,
    handshake: Arc<dyn HandshakeChannel>,
    flags: NodeFlags,
    flags_path: Option<PathBuf>,
}

impl NodeAgent {
    /// A fresh node in admin party with nothing installed.
    pub fn new(
        couch: CouchConfig,
        provisioner: SecretProvisioner,
        process: Arc<dyn ProcessControl>,
        handshake: Arc<dyn HandshakeChannel>,
    ) -> Self {
        let machine = SecurityStateMachine::new(provisioner.clone(), couch.clone());
        Self::assemble(couch, provisioner, machine, process, handshake, NodeFlags::default(), None)
    }

    /// Pick up where a previous process left off: flags from `flags_path`,
    /// security state from the bundle and `local.ini`.
    pub async fn resume(
        couch: CouchConfig,
        provisioner: SecretProvisioner,
        process: Arc<dyn ProcessControl>,
        handshake: Arc<dyn HandshakeChannel>,
        flags_path: PathBuf,
    ) -> AppResult<Self> {
        let flags: NodeFlags = read_json_or_default(&flags_path)
            .map_err(|e| AppError::config_io(&flags_path, e))?;
        let machine = SecurityStateMachine::resume(provisioner.clone(), couch.clone()).await?;
        debug!("Resumed node with {:?} in {:?}", flags, machine.state());
        Ok(Self::assemble(
            couch,
            provisioner,
            machine,
            process,
            handshake,
            flags,
            Some(flags_path),
        ))
    }

    fn assemble(
        couch: CouchConfig,
        provisioner: SecretProvisioner,
        machine: SecurityStateMachine,
        process: Arc<dyn ProcessControl>,
        handshake: Arc<dyn HandshakeChannel>,
        flags: NodeFlags,
        flags_path: Option<PathBuf>,
    ) -> Self {
        let reconciler = ConfigReconciler::new(&couch.config_dir);
        Self {
            couch,
            provisioner,
            machine,
            reconciler,
            process,
            handshake,
            flags,
            flags_path,
        }
    }

    pub fn flags(&self) -> &NodeFlags {
        &self.flags
    }

    pub fn security_state(&self) -> SecurityState {
        self.machine.state()
    }

    /// Handle one event, then restart the service if config changed.
    pub async fn handle(&mut self, event: NodeEvent) -> AppResult<()> {
        debug!("Handling {:?}", event);
        let dispatched = self.dispatch(event).await;
        let restarted = self.restart_if_pending();
        self.save_flags()?;
        dispatched.and(restarted)
    }

    async fn dispatch(&mut self, event: NodeEvent) -> AppResult<()> {
        match event {
            NodeEvent::Install => self.install().await,
            NodeEvent::Start => {
                self.flags.restart_pending = true;
                Ok(())
            }
            NodeEvent::Stop => {
                self.process.stop_service(&self.couch.service_name)?;
                self.flags.running = false;
                Ok(())
            }
            NodeEvent::LeadershipChanged { is_leader } => {
                debug!("Leadership changed (leader: {})", is_leader);
                self.advance_security(Trigger::LeadershipChanged).await
            }
            NodeEvent::SettingsChanged => self.advance_security(Trigger::SettingsChanged).await,
            NodeEvent::PeerJoined { relation } => self.peer_joined(&relation).await,
        }
    }

    async fn install(&mut self) -> AppResult<()> {
        self.process.install_packages(&self.couch.packages)?;
        self.reconciler
            .reconcile(&layout::base_documents(&self.couch))
            .into_result()?;
        info!("Installed {}", self.couch.service_name);

        self.flags.installed = true;
        self.flags.restart_pending = true;
        self.advance_security(Trigger::SettingsChanged).await
    }

    async fn advance_security(&mut self, trigger: Trigger) -> AppResult<()> {
        if !self.flags.installed {
            // Nothing to secure yet, but the leader can already publish
            self.provisioner.ensure_provisioned().await?;
            return Ok(());
        }
        for effect in self.machine.handle(trigger).await? {
            match effect {
                Effect::RestartService => self.flags.restart_pending = true,
            }
        }
        Ok(())
    }

    async fn peer_joined(&self, relation: &str) -> AppResult<()> {
        let Some(bundle) = read_bundle(self.provisioner.settings().as_ref()).await? else {
            warn!("Peer joined {} before passwords were provisioned; skipping", relation);
            return Ok(());
        };
        let payload = build_payload(&self.couch, &bundle);
        self.handshake.send(relation, &payload)?;
        info!("Sent connection details to {}", relation);
        Ok(())
    }

    fn restart_if_pending(&mut self) -> AppResult<()> {
        if !(self.flags.installed && self.flags.restart_pending) {
            return Ok(());
        }
        self.process
            .start_or_restart_service(&self.couch.service_name)?;
        self.flags.restart_pending = false;
        self.flags.running = true;
        self.process.expose_port(self.couch.port)
    }

    fn save_flags(&self) -> AppResult<()> {
        match &self.flags_path {
            Some(path) => {
                write_json_pretty(path, &self.flags).map_err(|e| AppError::config_io(path, e))
            }
            None => Ok(()),
        }
    }

    /// Consume events until the channel closes.
    ///
    /// A fatal error stops the loop; anything else is logged and left for
    /// the next event to repair.
    pub async fn run(mut self, mut events: mpsc::Receiver<NodeEvent>) -> AppResult<Self> {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                if e.is_fatal() {
                    error!("Halting node agent: {}", e);
                    return Err(e);
                }
                warn!("Event failed, will retry on the next one: {}", e);
            }
        }
        Ok(self)
    }
}

impl std::fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgent")
            .field("state", &self.machine.state())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Translate cluster notifications into events for node `id`.
///
/// Ends when either side of the bridge closes.
pub fn forward_cluster_events(
    id: NodeId,
    mut cluster: broadcast::Receiver<ClusterEvent>,
    events: mpsc::Sender<NodeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match cluster.recv().await {
                Ok(ClusterEvent::LeaderChanged { leader }) => NodeEvent::LeadershipChanged {
                    is_leader: leader == Some(id),
                },
                Ok(ClusterEvent::SettingsChanged { .. }) => NodeEvent::SettingsChanged,
                // Missed notifications: re-read everything
                Err(broadcast::error::RecvError::Lagged(_)) => NodeEvent::SettingsChanged,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::PASSWORDS_KEY;
    use crate::settings::{InMemoryCluster, SharedSettings};
    use couchkeeper_types::HandshakePayload;
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    static TEST_ID: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let id = TEST_ID.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "couchkeeper-node-{}-{}",
            std::process::id(),
            id
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, HandshakePayload)>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProcessControl for Recorder {
        fn install_packages(&self, names: &[String]) -> AppResult<()> {
            self.calls.lock().unwrap().push(format!("install {}", names.join(" ")));
            Ok(())
        }

        fn start_or_restart_service(&self, name: &str) -> AppResult<()> {
            self.calls.lock().unwrap().push(format!("restart {}", name));
            Ok(())
        }

        fn stop_service(&self, name: &str) -> AppResult<()> {
            self.calls.lock().unwrap().push(format!("stop {}", name));
            Ok(())
        }

        fn expose_port(&self, port: u16) -> AppResult<()> {
            self.calls.lock().unwrap().push(format!("open-port {}", port));
            Ok(())
        }
    }

    impl HandshakeChannel for Recorder {
        fn send(&self, relation: &str, payload: &HandshakePayload) -> AppResult<()> {
            self.sent
                .lock()
                .unwrap()
                .push((relation.to_string(), payload.clone()));
            Ok(())
        }
    }

    fn agent(
        dir: &std::path::Path,
        settings: Arc<dyn SharedSettings>,
        recorder: &Arc<Recorder>,
    ) -> NodeAgent {
        let couch = CouchConfig {
            config_dir: dir.to_path_buf(),
            packages: vec!["couchdb".to_string()],
            ..CouchConfig::default()
        };
        NodeAgent::new(
            couch,
            SecretProvisioner::new(settings),
            recorder.clone(),
            recorder.clone(),
        )
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(NodeEvent::from_hook("install", None), Some(NodeEvent::Install));
        assert_eq!(
            NodeEvent::from_hook("leader-elected", None),
            Some(NodeEvent::LeadershipChanged { is_leader: true })
        );
        assert_eq!(
            NodeEvent::from_hook("db-relation-joined", Some("db:3")),
            Some(NodeEvent::PeerJoined {
                relation: "db:3".to_string()
            })
        );
        assert_eq!(NodeEvent::from_hook("update-status", None), None);
    }

    #[tokio::test]
    async fn test_leader_install_secures_and_restarts_once() {
        let dir = temp_dir();
        let cluster = InMemoryCluster::new();
        cluster.elect(1).await;
        let recorder = Arc::new(Recorder::default());
        let mut node = agent(&dir, Arc::new(cluster.node(1)), &recorder);

        node.handle(NodeEvent::Install).await.unwrap();

        assert_eq!(node.security_state(), SecurityState::Secured);
        assert_eq!(
            recorder.calls(),
            vec!["install couchdb", "restart couchdb", "open-port 5984"]
        );
        assert!(node.flags().running);
        assert!(!node.flags().restart_pending);

        let local = fs::read_to_string(dir.join("local.ini")).unwrap();
        assert!(local.contains("require_valid_user = true"));
        assert!(dir.join("default.ini").exists());
        // base pass created the file, secured pass backed it up
        assert!(dir.join("local.ini.bak").exists());
    }

    #[tokio::test]
    async fn test_follower_restarts_again_once_secured() {
        let dir = temp_dir();
        let cluster = InMemoryCluster::new();
        let recorder = Arc::new(Recorder::default());
        let mut node = agent(&dir, Arc::new(cluster.node(2)), &recorder);

        node.handle(NodeEvent::Install).await.unwrap();
        assert_eq!(node.security_state(), SecurityState::Open);

        cluster.elect(1).await;
        cluster
            .node(1)
            .set(PASSWORDS_KEY, r#"{"admin_pass":"foo","repl_pass":"bar"}"#)
            .await
            .unwrap();
        node.handle(NodeEvent::SettingsChanged).await.unwrap();
        node.handle(NodeEvent::SettingsChanged).await.unwrap();

        assert_eq!(node.security_state(), SecurityState::Secured);
        let restarts = recorder
            .calls()
            .iter()
            .filter(|c| c.starts_with("restart"))
            .count();
        assert_eq!(restarts, 2);
    }

    #[tokio::test]
    async fn test_events_before_install_only_provision() {
        let dir = temp_dir();
        let cluster = InMemoryCluster::new();
        cluster.elect(1).await;
        let recorder = Arc::new(Recorder::default());
        let mut node = agent(&dir, Arc::new(cluster.node(1)), &recorder);

        node.handle(NodeEvent::LeadershipChanged { is_leader: true })
            .await
            .unwrap();

        assert!(cluster.value(PASSWORDS_KEY).is_some());
        assert_eq!(node.security_state(), SecurityState::Open);
        assert!(recorder.calls().is_empty());
        assert!(!dir.join("local.ini").exists());
    }

    #[tokio::test]
    async fn test_peer_joined_sends_bundle() {
        let dir = temp_dir();
        let cluster = InMemoryCluster::new();
        cluster.elect(1).await;
        let recorder = Arc::new(Recorder::default());
        let mut node = agent(&dir, Arc::new(cluster.node(1)), &recorder);

        node.handle(NodeEvent::PeerJoined {
            relation: "db:1".to_string(),
        })
        .await
        .unwrap();
        assert!(recorder.sent.lock().unwrap().is_empty());

        node.handle(NodeEvent::Install).await.unwrap();
        node.handle(NodeEvent::PeerJoined {
            relation: "db:1".to_string(),
        })
        .await
        .unwrap();

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "db:1");
        assert_eq!(sent[0].1.port, 5984);
        assert!(!sent[0].1.admin_pass.is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_start() {
        let dir = temp_dir();
        let cluster = InMemoryCluster::new();
        let recorder = Arc::new(Recorder::default());
        let mut node = agent(&dir, Arc::new(cluster.node(1)), &recorder);

        node.handle(NodeEvent::Install).await.unwrap();
        node.handle(NodeEvent::Stop).await.unwrap();
        assert!(!node.flags().running);

        node.handle(NodeEvent::Start).await.unwrap();
        assert!(node.flags().running);
        assert_eq!(
            recorder.calls()[3..],
            ["stop couchdb", "restart couchdb", "open-port 5984"]
        );
    }

    #[tokio::test]
    async fn test_flags_survive_resume() {
        let dir = temp_dir();
        let flags_path = dir.join("state").join("node.json");
        let cluster = InMemoryCluster::new();
        cluster.elect(1).await;
        let recorder = Arc::new(Recorder::default());
        let couch = CouchConfig {
            config_dir: dir.clone(),
            ..CouchConfig::default()
        };
        let provisioner = SecretProvisioner::new(Arc::new(cluster.node(1)));

        let mut node = NodeAgent::resume(
            couch.clone(),
            provisioner.clone(),
            recorder.clone(),
            recorder.clone(),
            flags_path.clone(),
        )
        .await
        .unwrap();
        node.handle(NodeEvent::Install).await.unwrap();

        let resumed = NodeAgent::resume(couch, provisioner, recorder.clone(), recorder, flags_path)
            .await
            .unwrap();
        assert!(resumed.flags().installed);
        assert_eq!(resumed.security_state(), SecurityState::Secured);
    }

    #[tokio::test]
    async fn test_run_loop_consumes_forwarded_cluster_events() {
        let dir = temp_dir();
        let cluster = InMemoryCluster::new();
        let recorder = Arc::new(Recorder::default());
        let mut node = agent(&dir, Arc::new(cluster.node(1)), &recorder);
        node.handle(NodeEvent::Install).await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let bridge = forward_cluster_events(1, cluster.subscribe(), tx);
        let running = tokio::spawn(node.run(rx));

        cluster.elect(1).await;
        // wait for the leader to publish
        let mut tries = 0;
        while cluster.value(PASSWORDS_KEY).is_none() && tries < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tries += 1;
        }
        drop(cluster);
        bridge.abort();

        let node = running.await.unwrap().unwrap();
        assert_eq!(node.security_state(), SecurityState::Secured);
    }
}
