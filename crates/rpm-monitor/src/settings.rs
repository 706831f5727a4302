//! Layered configuration: optional TOML file, then `RPM_MONITOR__*` variables

use anyhow::{anyhow, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use obd_link::{ConnectConfig, DeviceRef, SerialOpener, SessionConfig, DEFAULT_BAUD_RATE};
use obd_protocol::{FramingConfig, InitConfig, ObdProtocol, Pid};
use obd_scheduler::PollerConfig;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// Variable naming the config file
pub const CONFIG_PATH_ENV: &str = "RPM_MONITOR_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "rpm-monitor.toml";
const ENV_PREFIX: &str = "RPM_MONITOR";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Maximum tracing level
    pub log_level: String,
    pub baud_rate: u32,
    /// Bonded adapters and the tty each is bound to
    pub devices: Vec<DeviceSettings>,
    pub connect: ConnectSettings,
    pub adapter: AdapterSettings,
    pub poll: PollSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSettings {
    pub address: String,
    pub port: String,
    pub name: Option<String>,
    /// Service id found by discovery, tried ahead of SPP
    pub service: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectSettings {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub insecure_fallback: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    pub startup_delay_ms: u64,
    pub reset_attempts: u32,
    pub max_wait_ms: u64,
    pub inactivity_ms: u64,
    pub drain_window_ms: u64,
    pub max_resends: u32,
    /// `ATSP` protocol numbers, tried in order
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub pid: u8,
    pub interval_ms: u64,
    pub error_threshold: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            devices: Vec::new(),
            connect: ConnectSettings::default(),
            adapter: AdapterSettings::default(),
            poll: PollSettings::default(),
        }
    }
}

impl Default for ConnectSettings {
    fn default() -> Self {
        let defaults = ConnectConfig::default();
        Self {
            max_retries: defaults.max_retries,
            backoff_ms: defaults.backoff.as_millis() as u64,
            insecure_fallback: defaults.insecure_fallback,
        }
    }
}

impl Default for AdapterSettings {
    fn default() -> Self {
        let framing = FramingConfig::default();
        let init = InitConfig::default();
        Self {
            startup_delay_ms: init.startup_delay.as_millis() as u64,
            reset_attempts: init.reset_attempts,
            max_wait_ms: framing.max_wait.as_millis() as u64,
            inactivity_ms: framing.inactivity.as_millis() as u64,
            drain_window_ms: framing.drain_window.as_millis() as u64,
            max_resends: framing.max_resends,
            candidates: init
                .candidates
                .iter()
                .map(|p| p.number().to_string())
                .collect(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            pid: Pid::Rpm.as_hex(),
            interval_ms: 1000,
            error_threshold: 10,
        }
    }
}

impl MonitorSettings {
    /// Read the file named by [`CONFIG_PATH_ENV`] if present, then the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_sources(
            Config::builder().add_source(File::new(&path, FileFormat::Toml).required(false)),
            environment(),
        )
    }

    fn from_sources(
        builder: ConfigBuilder<DefaultState>,
        env: Environment,
    ) -> Result<Self, ConfigError> {
        builder.add_source(env).build()?.try_deserialize()
    }

    pub fn devices(&self) -> Vec<DeviceRef> {
        self.devices
            .iter()
            .map(|d| {
                let mut device = DeviceRef::new(&d.address);
                if let Some(name) = &d.name {
                    device = device.with_name(name);
                }
                if let Some(service) = d.service {
                    device = device.with_discovered_service(service);
                }
                device
            })
            .collect()
    }

    pub fn opener(&self) -> SerialOpener {
        self.devices
            .iter()
            .fold(SerialOpener::new(self.baud_rate), |opener, d| {
                opener.with_port(&d.address, &d.port)
            })
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        let adapter = &self.adapter;
        let candidates = adapter
            .candidates
            .iter()
            .map(|c| parse_candidate(c))
            .collect::<Result<Vec<_>>>()?;
        if candidates.is_empty() {
            return Err(anyhow!("adapter.candidates must not be empty"));
        }

        Ok(SessionConfig {
            connect: ConnectConfig {
                max_retries: self.connect.max_retries,
                backoff: Duration::from_millis(self.connect.backoff_ms),
                insecure_fallback: self.connect.insecure_fallback,
            },
            framing: FramingConfig {
                max_wait: Duration::from_millis(adapter.max_wait_ms),
                inactivity: Duration::from_millis(adapter.inactivity_ms),
                drain_window: Duration::from_millis(adapter.drain_window_ms),
                max_resends: adapter.max_resends,
            },
            init: InitConfig {
                startup_delay: Duration::from_millis(adapter.startup_delay_ms),
                reset_attempts: adapter.reset_attempts,
                candidates,
                ..InitConfig::default()
            },
            poller: PollerConfig {
                pid: self.poll.pid,
                interval: Duration::from_millis(self.poll.interval_ms),
                error_threshold: self.poll.error_threshold,
                ..PollerConfig::default()
            },
        })
    }
}

/// `RPM_MONITOR__POLL__INTERVAL_MS` sets `poll.interval_ms`
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

fn parse_candidate(text: &str) -> Result<ObdProtocol> {
    let mut chars = text.trim().chars();
    match (chars.next().and_then(ObdProtocol::from_number), chars.next()) {
        (Some(protocol), None) => Ok(protocol),
        _ => Err(anyhow!("unknown protocol number {:?}", text)),
    }
}
