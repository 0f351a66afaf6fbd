//! Session policy constants and configuration loading.
//!
//! The magnitudes here are policy, not structure: every delay can be
//! overridden from a TOML file. Durations are written as integer milliseconds.
//!
//! ```toml
//! expiration_delay = 900000
//! lock_max_tries = 100
//!
//! [storage]
//! type = "file"
//! path = "/home/me/.tabsync/_tabsync_s"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs_err as fs;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::storage::{FileStrategy, MemoryStrategy, SessionStoreStrategy};

/// Cross-tab poll interval; also the activity throttle window.
pub const POLL_DELAY: Duration = Duration::from_secs(1);
/// Interval at which a visible page expands its session.
pub const VISIBILITY_CHECK_DELAY: Duration = Duration::from_secs(60);
/// Inactivity window: `expire` is rewritten to now + this on every write.
pub const EXPIRATION_DELAY: Duration = Duration::from_secs(15 * 60);
/// Absolute session lifetime, measured from `created`.
pub const TIME_OUT_DELAY: Duration = Duration::from_secs(4 * 60 * 60);
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
pub const LOCK_MAX_TRIES: u32 = 100;
pub const HISTORY_CLEAR_INTERVAL: Duration = Duration::from_secs(60);

const STATE_DIR_NAME: &str = ".tabsync";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Which medium holds the shared session blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// A file shared by every process on the machine. `None` uses the
    /// default location under [`default_state_dir`].
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    /// Process-local memory. Only useful when a single process hosts all tabs.
    Memory {
        #[serde(default)]
        locking: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File { path: None }
    }
}

impl StorageConfig {
    /// Builds the strategy this configuration describes.
    pub fn build(&self) -> Result<Arc<dyn SessionStoreStrategy>> {
        match self {
            StorageConfig::File { path: Some(path) } => Ok(Arc::new(FileStrategy::new(path))),
            StorageConfig::File { path: None } => {
                Ok(Arc::new(FileStrategy::in_dir(&default_state_dir()?)))
            }
            StorageConfig::Memory { locking } => Ok(Arc::new(MemoryStrategy::new(*locking))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "duration_ms")]
    pub poll_delay: Duration,
    #[serde(with = "duration_ms")]
    pub visibility_check_delay: Duration,
    #[serde(with = "duration_ms")]
    pub expiration_delay: Duration,
    #[serde(with = "duration_ms")]
    pub time_out_delay: Duration,
    #[serde(with = "duration_ms")]
    pub lock_retry_delay: Duration,
    pub lock_max_tries: u32,
    #[serde(with = "duration_ms")]
    pub history_clear_interval: Duration,
    pub storage: StorageConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            poll_delay: POLL_DELAY,
            visibility_check_delay: VISIBILITY_CHECK_DELAY,
            expiration_delay: EXPIRATION_DELAY,
            time_out_delay: TIME_OUT_DELAY,
            lock_retry_delay: LOCK_RETRY_DELAY,
            lock_max_tries: LOCK_MAX_TRIES,
            history_clear_interval: HISTORY_CLEAR_INTERVAL,
            storage: StorageConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Name of the first timer period set to zero, if any. Timers cannot
    /// tick at a zero period.
    pub fn zero_timer_period(&self) -> Option<&'static str> {
        [
            ("poll_delay", self.poll_delay),
            ("visibility_check_delay", self.visibility_check_delay),
            ("history_clear_interval", self.history_clear_interval),
        ]
        .into_iter()
        .find(|(_, period)| period.is_zero())
        .map(|(field, _)| field)
    }
}

/// Returns the state directory (`~/.tabsync`).
pub fn default_state_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(STATE_DIR_NAME))
        .ok_or(SessionError::HomeDirNotFound)
}

/// Returns the default configuration file path (`~/.tabsync/config.toml`).
pub fn default_config_path() -> Result<PathBuf> {
    default_state_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Loads a configuration file, returning defaults if it doesn't exist.
pub fn load_config(path: &Path) -> Result<SessionConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SessionConfig::default())
        }
        Err(source) => {
            return Err(SessionError::ConfigRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let config: SessionConfig =
        toml::from_str(&content).map_err(|err| SessionError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;

    if let Some(field) = config.zero_timer_period() {
        return Err(SessionError::ConfigMalformed {
            path: path.to_path_buf(),
            details: format!("{} must be greater than zero", field),
        });
    }
    Ok(config)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
