//! Cluster-aware Couchbase DCP change-data-capture client.
//!
//! Consumes the Database Change Protocol stream of a source bucket,
//! delivers mutation/deletion/expiration events to an application
//! [`Listener`], and durably checkpoints stream progress so consumption
//! resumes exactly where it left off across restarts, rebalances, and
//! membership changes.
//!
//! The wire-level DCP codec is external: a concrete SDK (or the in-memory
//! cluster from [`testing`]) plugs in through
//! [`cluster::agent::AgentFactory`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dcp_client::{Dcp, DcpConfig, DcpEvent};
//!
//! # async fn run(factory: Arc<dyn dcp_client::cluster::agent::AgentFactory>) -> Result<(), dcp_client::DcpError> {
//! let mut config = DcpConfig::default();
//! config.hosts = vec!["127.0.0.1:8091".into()];
//! config.bucket_name = "orders".into();
//! config.dcp.group.name = "order-indexer".into();
//!
//! let listener = Arc::new(|event: DcpEvent| -> Result<(), dcp_client::DcpError> {
//!     println!("vb {} seq {}", event.vb_id(), event.seq_no());
//!     Ok(())
//! });
//!
//! let mut dcp = Dcp::connect(config, listener, factory).await?;
//! dcp.start().await?;
//! dcp.wait_for_shutdown().await?;
//! dcp.close().await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod membership;
pub mod metadata;
pub mod models;
pub mod stream;
pub mod testing;

pub use config::DcpConfig;
pub use error::DcpError;
pub use membership::Membership;
pub use models::{DcpEvent, Listener};

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bus::EventBus;
use crate::cluster::agent::AgentFactory;
use crate::cluster::{ClusterClient, HealthCheck};
use crate::config::{CheckpointKind, MetadataKind};
use crate::discovery::{
    HeartbeatTransport, LeaderElection, ServiceDiscovery, TcpHeartbeatTransport,
};
use crate::metadata::{CouchbaseMetadata, FileMetadata, Metadata, ReadOnlyMetadata};
use crate::models::VbId;
use crate::stream::{CheckpointManager, OffsetLedger, StreamEngine, VBucketDiscovery};

/// What ended the client's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// [`Dcp::stop`] was called.
    StopRequested,
    /// The process received a termination signal.
    Signal,
    /// The health check gave up on the cluster.
    HealthCheckFailed,
}

/// The client facade: wires the cluster client, checkpointing, discovery,
/// and the stream engine, and owns the shutdown lifecycle.
pub struct Dcp {
    config: Arc<DcpConfig>,
    client: Arc<ClusterClient>,
    bus: Arc<EventBus>,
    listener: Arc<dyn Listener>,
    metadata_override: Option<Arc<dyn Metadata>>,
    transport_override: Option<Arc<dyn HeartbeatTransport>>,
    engine: Option<Arc<StreamEngine>>,
    health_check: Option<HealthCheck>,
    health_failed_rx: Option<oneshot::Receiver<()>>,
    service_discovery: Option<Arc<ServiceDiscovery>>,
    leader_election: Option<LeaderElection>,
    stop: CancellationToken,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    shutdown_cause: Option<ShutdownCause>,
}

impl Dcp {
    /// Validates `config` and establishes the data and DCP sessions.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::ConfigInvalid`] for rejected configuration and
    /// [`DcpError::Transport`] when the sessions cannot be established.
    pub async fn connect(
        config: DcpConfig,
        listener: Arc<dyn Listener>,
        factory: Arc<dyn AgentFactory>,
    ) -> Result<Self, DcpError> {
        config.validate()?;
        // Fails fast on unreadable TLS material; the bundle itself is
        // consumed by the agent factory.
        let _root_ca = config.load_root_ca()?;
        info!(config = %serde_json::to_string(&config.redacted()).unwrap_or_default(), "using config");

        let config = Arc::new(config);
        let client = Arc::new(ClusterClient::new(Arc::clone(&config), factory));
        client.connect().await?;
        client.dcp_connect().await?;

        let (ready_tx, ready_rx) = watch::channel(false);
        Ok(Self {
            config,
            client,
            bus: Arc::new(EventBus::new()),
            listener,
            metadata_override: None,
            transport_override: None,
            engine: None,
            health_check: None,
            health_failed_rx: None,
            service_discovery: None,
            leader_election: None,
            stop: CancellationToken::new(),
            ready_tx,
            ready_rx,
            shutdown_cause: None,
        })
    }

    /// Replaces the config-selected metadata backend. Must be called
    /// before [`Dcp::start`].
    pub fn set_metadata(&mut self, metadata: Arc<dyn Metadata>) {
        self.metadata_override = Some(metadata);
    }

    /// Replaces the TCP heartbeat transport. Must be called before
    /// [`Dcp::start`].
    pub fn set_heartbeat_transport(&mut self, transport: Arc<dyn HeartbeatTransport>) {
        self.transport_override = Some(transport);
    }

    fn build_metadata(&self) -> Result<Arc<dyn Metadata>, DcpError> {
        let metadata: Arc<dyn Metadata> = match &self.metadata_override {
            Some(metadata) => Arc::clone(metadata),
            None => match self.config.metadata.kind {
                MetadataKind::Couchbase => Arc::new(CouchbaseMetadata::new(
                    Arc::clone(&self.client),
                    self.config.metadata.prefix.clone(),
                    self.config.dcp.group.name.clone(),
                )),
                MetadataKind::File => {
                    let path = self
                        .config
                        .metadata
                        .file_path
                        .clone()
                        .ok_or_else(|| {
                            DcpError::ConfigInvalid("metadata.filePath is required".into())
                        })?;
                    Arc::new(FileMetadata::new(path))
                }
            },
        };

        if self.config.metadata.read_only {
            Ok(Arc::new(ReadOnlyMetadata::new(metadata)))
        } else {
            Ok(metadata)
        }
    }

    /// Builds and opens the stream engine, starts discovery, election, and
    /// health supervision, then signals readiness.
    ///
    /// # Errors
    ///
    /// Metadata load failures, topology failures, and stream-open failures
    /// at startup are fatal.
    pub async fn start(&mut self) -> Result<(), DcpError> {
        let metadata = self.build_metadata()?;

        let num_vbuckets = self.client.get_num_vbuckets()?;
        let bucket_uuid = self.client.get_bucket_uuid()?;
        let vb_ids: Vec<VbId> = (0..num_vbuckets).collect();

        let collection_ids = if self.config.is_collection_mode_enabled() {
            self.client
                .get_collection_ids(&self.config.scope_name, &self.config.collection_names)
                .await?
        } else {
            std::collections::HashMap::new()
        };

        let ledger = Arc::new(OffsetLedger::new());
        let checkpoint = Arc::new(CheckpointManager::new(
            self.config.checkpoint.clone(),
            Arc::clone(&self.client),
            metadata,
            Arc::clone(&ledger),
            bucket_uuid,
            vb_ids,
        ));

        // Subscribe before the election can publish anything.
        let mut membership_rx = self.bus.subscribe(bus::MEMBERSHIP_CHANGED);
        let engine = StreamEngine::new(
            &self.config,
            Arc::clone(&self.client),
            ledger,
            checkpoint,
            VBucketDiscovery::new(num_vbuckets),
            Arc::clone(&self.listener),
            &collection_ids,
            &self.bus,
        );

        let initial = if self.config.leader_election.enabled {
            let transport: Arc<dyn HeartbeatTransport> = match &self.transport_override {
                Some(transport) => Arc::clone(transport),
                None => Arc::new(TcpHeartbeatTransport::new(
                    self.config.leader_election.listen_address.clone(),
                )),
            };
            let service_discovery = Arc::new(ServiceDiscovery::new(
                self.config.leader_election.clone(),
                transport,
            ));
            service_discovery.start_heartbeat();

            let leader_election = LeaderElection::new(
                self.config.leader_election.clone(),
                Arc::clone(&service_discovery),
                Arc::clone(&self.bus),
            );
            leader_election.start();

            self.service_discovery = Some(service_discovery);
            self.leader_election = Some(leader_election);

            // The election publishes its first assignment on its first
            // tick; that assignment seeds the engine.
            match membership_rx.recv().await {
                Some(bus::BusEvent::MembershipChanged(membership)) => membership,
                None => return Err(DcpError::Protocol("membership channel closed".into())),
            }
        } else {
            Membership::SINGLE
        };

        engine.open(initial).await?;
        self.engine = Some(engine);

        if !self.config.health_check.disabled {
            let health_check = HealthCheck::new(
                self.config.health_check.clone(),
                Arc::clone(&self.client),
            );
            let (failed_tx, failed_rx) = oneshot::channel();
            health_check.start(failed_tx);
            self.health_check = Some(health_check);
            self.health_failed_rx = Some(failed_rx);
        }

        let _ = self.ready_tx.send(true);
        info!("dcp stream started");
        Ok(())
    }

    /// Resolves once [`Dcp::start`] has opened the stream.
    pub async fn wait_until_ready(&self) {
        let mut ready = self.ready_rx.clone();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    /// Blocks until the first shutdown trigger: a stop request, a
    /// termination signal (`SIGTERM`, `SIGINT`, `SIGABRT`, `SIGQUIT`), or
    /// a health-check failure. Later triggers are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::Transport`] when signal handlers cannot be
    /// installed.
    pub async fn wait_for_shutdown(&mut self) -> Result<ShutdownCause, DcpError> {
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| DcpError::Transport(e.to_string()))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| DcpError::Transport(e.to_string()))?;
        // SIGABRT has no named constructor; 6 on every supported platform.
        let mut sigabrt = signal(SignalKind::from_raw(6))
            .map_err(|e| DcpError::Transport(e.to_string()))?;
        let mut sigquit =
            signal(SignalKind::quit()).map_err(|e| DcpError::Transport(e.to_string()))?;

        let health_failed_rx = self.health_failed_rx.take();
        let health_failed = async move {
            match health_failed_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => futures::future::pending::<()>().await,
            }
        };

        let cause = tokio::select! {
            () = self.stop.cancelled() => ShutdownCause::StopRequested,
            _ = sigterm.recv() => ShutdownCause::Signal,
            _ = sigint.recv() => ShutdownCause::Signal,
            _ = sigabrt.recv() => ShutdownCause::Signal,
            _ = sigquit.recv() => ShutdownCause::Signal,
            () = health_failed => ShutdownCause::HealthCheckFailed,
        };

        match cause {
            ShutdownCause::HealthCheckFailed => error!("shutting down, health check failed"),
            cause => info!(?cause, "shutting down"),
        }
        self.shutdown_cause = Some(cause);
        Ok(cause)
    }

    /// Requests shutdown; [`Dcp::wait_for_shutdown`] returns
    /// [`ShutdownCause::StopRequested`].
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// What ended the run, once shutdown has been triggered.
    #[must_use]
    pub fn shutdown_cause(&self) -> Option<ShutdownCause> {
        self.shutdown_cause
    }

    /// Persists the current offsets now (manual checkpointing).
    pub async fn commit(&self) {
        if let Some(engine) = &self.engine {
            engine.save().await;
        }
    }

    /// Graceful teardown: stops supervision and election, closes every
    /// stream (with a final save in auto checkpoint mode), and tears the
    /// sessions down.
    pub async fn close(&mut self) {
        let _ = self.ready_tx.send(false);

        if let Some(health_check) = self.health_check.take() {
            health_check.stop();
        }

        if let Some(engine) = self.engine.take() {
            // The final save belongs to auto checkpointing only; manual
            // mode persists solely on explicit commit.
            let graceful = self.config.checkpoint.kind == CheckpointKind::Auto;
            engine.close(graceful).await;
        }

        if let Some(leader_election) = self.leader_election.take() {
            leader_election.stop();
        }
        if let Some(service_discovery) = self.service_discovery.take() {
            service_discovery.stop_heartbeat();
        }

        self.client.dcp_close();
        self.client.close();

        info!("dcp stream closed");
    }

    /// Convenience lifecycle: start, wait for a shutdown trigger, close.
    ///
    /// # Errors
    ///
    /// Propagates startup failures; shutdown itself is infallible.
    pub async fn run(&mut self) -> Result<ShutdownCause, DcpError> {
        self.start().await?;
        let cause = self.wait_for_shutdown().await?;
        self.close().await;
        Ok(cause)
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &DcpConfig {
        &self.config
    }

    /// The stream engine, once started.
    #[must_use]
    pub fn engine(&self) -> Option<&Arc<StreamEngine>> {
        self.engine.as_ref()
    }

    /// `true` while this member leads the consumer group.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader_election
            .as_ref()
            .is_some_and(LeaderElection::is_leader)
    }
}
