//! Server settings, read from an optional TOML file. Every key has a
//! default, so the server runs with no configuration at all.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    web: WebSettings,
    #[serde(default)]
    stream: StreamSettings,
    #[serde(default)]
    params: ParamSettings,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WebSettings {
    default_port: Option<u16>,
    client_timeout: Option<String>,
    launch_browser: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StreamSettings {
    progress_queue_capacity: Option<usize>,
    disconnect_poll_interval: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ParamSettings {
    allowed_groups: Option<Vec<String>>,
}

impl Settings {
    /// 0 binds an ephemeral port.
    pub fn web_default_port(&self) -> u16 {
        self.web.default_port.unwrap_or(0)
    }

    /// How long the server stays up without a heartbeat from any tab.
    pub fn web_client_timeout(&self) -> Duration {
        self.web
            .client_timeout
            .as_deref()
            .and_then(|value| humantime::parse_duration(value).ok())
            .unwrap_or(Duration::from_secs(600))
    }

    pub fn web_launch_browser(&self) -> bool {
        self.web.launch_browser.unwrap_or(true)
    }

    /// Per-observer progress buffer size; the oldest update is dropped when
    /// it fills.
    pub fn stream_progress_queue_capacity(&self) -> usize {
        self.stream.progress_queue_capacity.unwrap_or(64)
    }

    /// Cadence at which a stream checks whether its client is still there.
    pub fn stream_disconnect_poll_interval(&self) -> Duration {
        self.stream
            .disconnect_poll_interval
            .as_deref()
            .and_then(|value| humantime::parse_duration(value).ok())
            .unwrap_or(Duration::from_millis(150))
    }

    /// The exhaustive set of legal parameter prefixes.
    pub fn params_allowed_groups(&self) -> Vec<String> {
        self.params.allowed_groups.clone().unwrap_or_else(|| {
            crate::params::DEFAULT_ALLOWED_GROUPS
                .iter()
                .map(|group| (*group).to_owned())
                .collect()
        })
    }
}

pub fn read_config(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("read config from {}", path.display()))?;
            toml::from_str(&text).context("parse config")
        }
        None => Ok(Settings::default()),
    }
}
