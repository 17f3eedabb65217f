//! Client configuration.
//!
//! [`DcpConfig`] mirrors the recognized option set of the host config file.
//! Parsing the file itself is the host's concern; this module only defines
//! the structs, their defaults, and startup validation.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DcpError;

/// Scope every bucket has by default.
pub const DEFAULT_SCOPE_NAME: &str = "_default";

/// Collection every scope has by default.
pub const DEFAULT_COLLECTION_NAME: &str = "_default";

/// Key prefix shared by all metadata documents written by this client.
pub const METADATA_PREFIX: &str = "_connector:cbgo:";

// ---------------------------------------------------------------------------
// Serde helper: Duration as milliseconds
// ---------------------------------------------------------------------------

/// Serde helper that encodes a [`Duration`] as a `u64` millisecond count.
mod duration_millis {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Default helpers
// ---------------------------------------------------------------------------

fn default_scope_name() -> String {
    DEFAULT_SCOPE_NAME.to_string()
}

fn default_collection_name() -> String {
    DEFAULT_COLLECTION_NAME.to_string()
}

fn default_metadata_prefix() -> String {
    METADATA_PREFIX.to_string()
}

/// Default DCP flow-control buffer: 16 MiB.
const fn default_buffer_size() -> usize {
    16 * 1024 * 1024
}

/// Default kernel connection buffer: 20 MiB.
const fn default_connection_buffer_size() -> usize {
    20 * 1024 * 1024
}

/// Default session establishment timeout: 5 seconds.
const fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Default checkpoint auto-save period: 20 seconds.
const fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(20)
}

/// Default health check period: 20 seconds.
const fn default_health_interval() -> Duration {
    Duration::from_secs(20)
}

/// Default ping timeout: 5 seconds.
const fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Default consecutive ping failures before giving up: 5.
const fn default_health_attempts() -> u32 {
    5
}

/// Default peer heartbeat period: 1 second.
const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}

/// Default staleness deadline for peer eviction: 10 seconds.
const fn default_heartbeat_deadline() -> Duration {
    Duration::from_secs(10)
}

/// Default observability API port.
const fn default_api_port() -> u16 {
    8080
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Consumer group identity. The group name is part of the DCP connection
/// name and of every checkpoint key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Consumer group name.
    pub name: String,
}

/// DCP transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DcpSessionConfig {
    /// Consumer group identity.
    pub group: GroupConfig,
    /// DCP flow-control buffer size in bytes.
    pub buffer_size: usize,
    /// Kernel connection buffer size in bytes.
    pub connection_buffer_size: usize,
    /// Deadline for establishing a session.
    #[serde(with = "duration_millis")]
    pub connection_timeout: Duration,
}

impl Default for DcpSessionConfig {
    fn default() -> Self {
        Self {
            group: GroupConfig::default(),
            buffer_size: default_buffer_size(),
            connection_buffer_size: default_connection_buffer_size(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

/// Where checkpoint documents are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataKind {
    /// One KV document per vBucket in a Couchbase bucket.
    #[default]
    Couchbase,
    /// A single JSON map on the local filesystem.
    File,
}

/// Metadata backend selection and placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Backend variant.
    #[serde(rename = "type")]
    pub kind: MetadataKind,
    /// Silently drop saves and clears; loads still work.
    pub read_only: bool,
    /// Key prefix for cluster-backed documents.
    pub prefix: String,
    /// Bucket holding checkpoint documents. Empty means the source bucket.
    pub bucket: String,
    /// Scope holding checkpoint documents.
    pub scope: String,
    /// Collection holding checkpoint documents.
    pub collection: String,
    /// Kernel connection buffer size for the metadata session.
    pub connection_buffer_size: usize,
    /// Checkpoint file path (file backend only).
    pub file_path: Option<PathBuf>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            kind: MetadataKind::Couchbase,
            read_only: false,
            prefix: default_metadata_prefix(),
            bucket: String::new(),
            scope: default_scope_name(),
            collection: default_collection_name(),
            connection_buffer_size: default_connection_buffer_size(),
            file_path: None,
        }
    }
}

/// When checkpoints are saved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    /// Periodic saves on a timer, plus the final save on graceful close.
    #[default]
    Auto,
    /// Saves happen only on explicit commit.
    Manual,
}

/// Policy when no prior checkpoint state exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointAutoReset {
    /// Start from each vBucket's current sequence number.
    Latest,
    /// Start from sequence number zero.
    #[default]
    None,
}

/// Checkpointing behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Save trigger.
    #[serde(rename = "type")]
    pub kind: CheckpointKind,
    /// Auto-save period.
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Empty-state policy.
    pub auto_reset: CheckpointAutoReset,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            kind: CheckpointKind::Auto,
            interval: default_checkpoint_interval(),
            auto_reset: CheckpointAutoReset::None,
        }
    }
}

/// Cluster health supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Skip supervision entirely.
    pub disabled: bool,
    /// Ping period.
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Per-ping deadline.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Consecutive failures before the failed signal fires.
    pub attempts: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            attempts: default_health_attempts(),
        }
    }
}

/// Peer discovery and leader election.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderElectionConfig {
    /// Enable peer heartbeating and election. When disabled the client runs
    /// as a single member owning every vBucket.
    pub enabled: bool,
    /// Stable identity of this member. Must be unique across the group.
    pub member_id: String,
    /// Address the heartbeat listener binds to.
    pub listen_address: String,
    /// Peer heartbeat addresses (static list).
    pub peers: Vec<String>,
    /// Heartbeat send period.
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    /// Peers silent longer than this are evicted.
    #[serde(with = "duration_millis")]
    pub heartbeat_deadline: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            member_id: String::new(),
            listen_address: String::new(),
            peers: Vec::new(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_deadline: default_heartbeat_deadline(),
        }
    }
}

/// Observability endpoints of the host process. Carried here so hosts can
/// configure them alongside everything else; the server itself lives
/// outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Skip serving the API.
    pub disabled: bool,
    /// Listen port.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            disabled: true,
            port: default_api_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Full client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DcpConfig {
    /// Cluster seed endpoints.
    pub hosts: Vec<String>,
    /// Auth user.
    pub username: String,
    /// Auth password.
    pub password: String,
    /// Source bucket to stream from.
    pub bucket_name: String,
    /// Scope filter for collection streaming.
    pub scope_name: String,
    /// Collections to stream; empty streams everything in the scope.
    pub collection_names: Vec<String>,
    /// DCP session tuning.
    pub dcp: DcpSessionConfig,
    /// Checkpoint persistence backend.
    pub metadata: MetadataConfig,
    /// Checkpointing behavior.
    pub checkpoint: CheckpointConfig,
    /// Cluster health supervision.
    pub health_check: HealthCheckConfig,
    /// Peer discovery and leader election.
    pub leader_election: LeaderElectionConfig,
    /// Observability endpoints of the host.
    pub api: ApiConfig,
    /// Use TLS for cluster connections.
    pub secure_connection: bool,
    /// Root CA bundle for TLS verification.
    pub root_ca_path: Option<PathBuf>,
}

impl Default for DcpConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            username: String::new(),
            password: String::new(),
            bucket_name: String::new(),
            scope_name: default_scope_name(),
            collection_names: Vec::new(),
            dcp: DcpSessionConfig::default(),
            metadata: MetadataConfig::default(),
            checkpoint: CheckpointConfig::default(),
            health_check: HealthCheckConfig::default(),
            leader_election: LeaderElectionConfig::default(),
            api: ApiConfig::default(),
            secure_connection: false,
            root_ca_path: None,
        }
    }
}

impl DcpConfig {
    /// Rejects configurations the engine cannot start with.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::ConfigInvalid`] naming the offending option.
    pub fn validate(&self) -> Result<(), DcpError> {
        if self.hosts.is_empty() {
            return Err(DcpError::ConfigInvalid("hosts must not be empty".into()));
        }
        if self.bucket_name.is_empty() {
            return Err(DcpError::ConfigInvalid("bucketName is required".into()));
        }
        if self.dcp.group.name.is_empty() {
            return Err(DcpError::ConfigInvalid("dcp.group.name is required".into()));
        }
        if self.checkpoint.kind == CheckpointKind::Auto && self.checkpoint.interval.is_zero() {
            return Err(DcpError::ConfigInvalid(
                "checkpoint.interval must be positive for auto checkpoints".into(),
            ));
        }
        if !self.health_check.disabled
            && (self.health_check.interval.is_zero() || self.health_check.attempts == 0)
        {
            return Err(DcpError::ConfigInvalid(
                "healthCheck.interval and healthCheck.attempts must be positive".into(),
            ));
        }
        if self.metadata.kind == MetadataKind::File && self.metadata.file_path.is_none() {
            return Err(DcpError::ConfigInvalid(
                "metadata.filePath is required for file metadata".into(),
            ));
        }
        if self.leader_election.enabled {
            if self.leader_election.member_id.is_empty() {
                return Err(DcpError::ConfigInvalid(
                    "leaderElection.memberId is required when election is enabled".into(),
                ));
            }
            if self.leader_election.listen_address.is_empty() {
                return Err(DcpError::ConfigInvalid(
                    "leaderElection.listenAddress is required when election is enabled".into(),
                ));
            }
        }
        if self.secure_connection && self.root_ca_path.is_none() {
            return Err(DcpError::ConfigInvalid(
                "rootCAPath is required for secure connections".into(),
            ));
        }
        Ok(())
    }

    /// Bucket holding checkpoint documents; defaults to the source bucket.
    #[must_use]
    pub fn metadata_bucket(&self) -> &str {
        if self.metadata.bucket.is_empty() {
            &self.bucket_name
        } else {
            &self.metadata.bucket
        }
    }

    /// `true` when streaming should be filtered to named collections.
    #[must_use]
    pub fn is_collection_mode_enabled(&self) -> bool {
        self.scope_name != DEFAULT_SCOPE_NAME || !self.collection_names.is_empty()
    }

    /// Loads the root CA bundle for TLS verification.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::ConfigInvalid`] when TLS is enabled but the
    /// bundle cannot be read.
    pub fn load_root_ca(&self) -> Result<Option<Vec<u8>>, DcpError> {
        if !self.secure_connection {
            return Ok(None);
        }
        let path = self
            .root_ca_path
            .as_ref()
            .ok_or_else(|| DcpError::ConfigInvalid("rootCAPath is required".into()))?;
        let pem = std::fs::read(path)
            .map_err(|e| DcpError::ConfigInvalid(format!("cannot read root CA bundle: {e}")))?;
        Ok(Some(pem))
    }

    /// Masks secrets for logging.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            password: "*****".to_string(),
            ..self.clone()
        }
    }
}
