use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::correlator::DEFAULT_RETENTION;
use crate::lifecycle::{HandlerSettings, DEFAULT_AUTH_TIMEOUT};

pub const DEFAULT_SECRET: &str = "change-me-in-production";

/// Settings of the hub core, usually read from the `[hub]` table of `devhub.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_secret")]
    pub secret: String,
    /// Seconds a fresh connection may take to send its credential.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Seconds a finished task stays readable before the next read reaps it.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
    /// Fail a peer's pending tasks when its connection closes instead of leaving them pending.
    #[serde(default)]
    pub fail_pending_on_disconnect: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            auth_timeout_secs: default_auth_timeout_secs(),
            task_retention_secs: default_task_retention_secs(),
            fail_pending_on_disconnect: false,
        }
    }
}

impl HubConfig {
    pub fn uses_default_secret(&self) -> bool {
        self.secret == DEFAULT_SECRET
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            auth_timeout: Duration::from_secs(self.auth_timeout_secs.max(1)),
            fail_pending_on_disconnect: self.fail_pending_on_disconnect,
        }
    }
}

pub fn default_secret() -> String {
    DEFAULT_SECRET.to_string()
}

pub fn default_auth_timeout_secs() -> u64 {
    DEFAULT_AUTH_TIMEOUT.as_secs()
}

pub fn default_task_retention_secs() -> u64 {
    DEFAULT_RETENTION.as_secs()
}
