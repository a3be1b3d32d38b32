use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Resource root shared by every client: marker file, change log, edit locks.
    pub storage_path: PathBuf,

    #[serde(with = "duration_ms")]
    pub serializer_poll_interval: Duration,    // Access serializer poll tick
    #[serde(with = "duration_ms")]
    pub edit_lock_poll_interval: Duration,     // Row lock poll tick
    #[serde(with = "duration_ms")]
    pub change_poll_interval: Duration,        // ChangeWatcher poll tick

    /// A marker older than this is treated as left behind by a crashed holder.
    /// `None` waits forever.
    #[serde(with = "opt_duration_ms")]
    pub stale_marker_after: Option<Duration>,

    pub log_append_retries: u32,
    #[serde(with = "duration_ms")]
    pub log_append_backoff: Duration,

    pub query_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./data"),
            serializer_poll_interval: Duration::from_millis(100),
            edit_lock_poll_interval: Duration::from_secs(1),
            change_poll_interval: Duration::from_secs(1),
            stale_marker_after: Some(Duration::from_secs(30)),
            log_append_retries: 5,
            log_append_backoff: Duration::from_millis(10),
            query_cache_size: 128,
        }
    }
}

impl Config {
    pub fn with_storage_path(path: impl Into<PathBuf>) -> Self {
        Config {
            storage_path: path.into(),
            ..Config::default()
        }
    }

    /// Load from a JSON file. Missing keys fall back to the defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

mod duration_ms {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_duration_ms {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
