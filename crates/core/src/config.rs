//! Service and per-volume configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Service-wide configuration shared by all volumes and the trash worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// How long a freshly written or touched block must survive before it
    /// may be trashed. References to a block (signed URLs) are assumed valid
    /// for this long.
    #[serde(default = "default_blob_signature_ttl_secs")]
    pub blob_signature_ttl_secs: u64,
    /// How long trashed blocks persist before permanent deletion. Zero
    /// disables the trash cycle entirely.
    #[serde(default)]
    pub trash_lifetime_secs: u64,
    /// Interval between trash sweeps.
    #[serde(default = "default_trash_check_interval_secs")]
    pub trash_check_interval_secs: u64,
    /// Concurrency of the per-volume trash sweep.
    #[serde(default = "default_empty_trash_workers")]
    pub empty_trash_workers: usize,
    /// Global kill switch for the trash worker.
    #[serde(default)]
    pub enable_delete: bool,
}

fn default_blob_signature_ttl_secs() -> u64 {
    14 * 24 * 3600
}

fn default_trash_check_interval_secs() -> u64 {
    24 * 3600
}

fn default_empty_trash_workers() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blob_signature_ttl_secs: default_blob_signature_ttl_secs(),
            trash_lifetime_secs: 0,
            trash_check_interval_secs: default_trash_check_interval_secs(),
            empty_trash_workers: default_empty_trash_workers(),
            enable_delete: false,
        }
    }
}

impl Config {
    pub fn blob_signature_ttl(&self) -> Duration {
        Duration::from_secs(self.blob_signature_ttl_secs)
    }

    pub fn trash_lifetime(&self) -> Duration {
        Duration::from_secs(self.trash_lifetime_secs)
    }

    pub fn trash_check_interval(&self) -> Duration {
        Duration::from_secs(self.trash_check_interval_secs)
    }

    /// Validate the sweep pacing against each volume's race window.
    ///
    /// The sweep refreshes race-recovered blocks, so it must revisit each
    /// block before its recency protection expires:
    /// `trash_check_interval < blob_signature_ttl - race_window`.
    pub fn validate(&self, volumes: &[VolumeConfig]) -> crate::Result<()> {
        if self.empty_trash_workers == 0 {
            return Err(crate::Error::Config(
                "empty_trash_workers must be at least 1".to_string(),
            ));
        }
        if !self.enable_delete || self.trash_lifetime_secs == 0 {
            return Ok(());
        }
        for volume in volumes {
            let race_window = volume.race_window_secs();
            if self.blob_signature_ttl_secs.saturating_sub(race_window)
                <= self.trash_check_interval_secs
            {
                return Err(crate::Error::Config(format!(
                    "trash_check_interval_secs {} must be less than \
                     blob_signature_ttl_secs - race_window_secs ({} - {}); \
                     blocks rescued from trash races would starve",
                    self.trash_check_interval_secs, self.blob_signature_ttl_secs, race_window,
                )));
            }
        }
        Ok(())
    }
}

/// Per-volume backend selection and knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VolumeConfig {
    /// S3-compatible bucket.
    S3 {
        bucket: String,
        /// Optional endpoint URL (MinIO, Ceph RadosGW, GCS interop).
        endpoint: Option<String>,
        region: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain.
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        /// Path-style URLs, required for MinIO and some compatibles.
        #[serde(default)]
        force_path_style: bool,
        #[serde(flatten)]
        tuning: VolumeTuning,
        /// Allow immediate DELETE when trash_lifetime is zero, accepting the
        /// known data-loss race with concurrent writers.
        #[serde(default)]
        unsafe_delete: bool,
    },
    /// Azure blob container.
    Azure {
        container: String,
        account: String,
        /// Optional endpoint override for Azurite and sovereign clouds.
        endpoint: Option<String>,
        access_key: Option<String>,
        #[serde(flatten)]
        tuning: VolumeTuning,
    },
}

/// Knobs common to every backend type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeTuning {
    #[serde(default = "default_index_page_size")]
    pub index_page_size: usize,
    /// Zero means "use the default", never "wait forever".
    #[serde(default)]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub read_timeout_secs: u64,
    /// Upper bound on the backend's eventual-consistency latency.
    #[serde(default = "default_race_window_secs")]
    pub race_window_secs: u64,
    #[serde(default)]
    pub read_only: bool,
    /// Storage redundancy reported to clients.
    #[serde(default = "default_replication")]
    pub replication: usize,
    #[serde(default)]
    pub storage_classes: Vec<String>,
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(600);

fn default_index_page_size() -> usize {
    1000
}

fn default_race_window_secs() -> u64 {
    24 * 3600
}

fn default_replication() -> usize {
    2
}

impl Default for VolumeTuning {
    fn default() -> Self {
        Self {
            index_page_size: default_index_page_size(),
            connect_timeout_secs: 0,
            read_timeout_secs: 0,
            race_window_secs: default_race_window_secs(),
            read_only: false,
            replication: default_replication(),
            storage_classes: Vec::new(),
        }
    }
}

impl VolumeTuning {
    pub fn connect_timeout(&self) -> Duration {
        if self.connect_timeout_secs == 0 {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            Duration::from_secs(self.connect_timeout_secs)
        }
    }

    pub fn read_timeout(&self) -> Duration {
        if self.read_timeout_secs == 0 {
            DEFAULT_READ_TIMEOUT
        } else {
            Duration::from_secs(self.read_timeout_secs)
        }
    }

    pub fn race_window(&self) -> Duration {
        Duration::from_secs(self.race_window_secs)
    }
}

impl VolumeConfig {
    pub fn tuning(&self) -> &VolumeTuning {
        match self {
            VolumeConfig::S3 { tuning, .. } => tuning,
            VolumeConfig::Azure { tuning, .. } => tuning,
        }
    }

    pub fn race_window_secs(&self) -> u64 {
        self.tuning().race_window_secs
    }

    pub fn validate(&self) -> crate::Result<()> {
        match self {
            VolumeConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id, secret_access_key) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(crate::Error::Config(
                    "s3 volume requires both access_key_id and secret_access_key \
                     when either is set"
                        .to_string(),
                )),
            },
            VolumeConfig::Azure { account, .. } => {
                if account.is_empty() {
                    Err(crate::Error::Config(
                        "azure volume requires a storage account name".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Dispatcher pacing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Queue polling frequency.
    #[serde(default = "default_poll_period_secs")]
    pub poll_period_secs: u64,
    /// Minimum wait between successive attempts to run the same container.
    #[serde(default)]
    pub min_retry_period_secs: u64,
}

fn default_poll_period_secs() -> u64 {
    10
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_period_secs: default_poll_period_secs(),
            min_retry_period_secs: 0,
        }
    }
}

impl DispatchConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }

    pub fn min_retry_period(&self) -> Duration {
        Duration::from_secs(self.min_retry_period_secs)
    }
}
