//! ELM327 initialization: reset, configure, negotiate a bus protocol
//!
//! The only way to obtain a [`ReadyAdapter`] is through a successful canary
//! request, so nothing can poll an adapter that never reached ready.

use crate::connection::Connection;
use crate::error::{HandshakeError, ObdError};
use crate::framing::{self, ElmChannel, FramingConfig};
use crate::parser;
use crate::pid::PidResponse;
use crate::protocol::{ObdProtocol, DEFAULT_CANDIDATES};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reset command
pub const RESET_COMMAND: &str = "ATZ";

/// Canary request: Mode 01 supported-PID bitmap
pub const CANARY_COMMAND: &str = "0100";

/// Ask the adapter which protocol it is using
pub const DESCRIBE_PROTOCOL_COMMAND: &str = "ATDPN";

/// Mode-setting commands, sent in this order after reset:
/// echo off, linefeeds off, spaces off, headers off, adaptive timing on,
/// response timeout 0x64 * 4 ms.
pub const CONFIGURE_COMMANDS: [&str; 6] = ["ATE0", "ATL0", "ATS0", "ATH0", "ATAT1", "ATST64"];

/// No handshake step runs more than this many times
const MAX_STEP_ATTEMPTS: u32 = 3;

/// Progress of the adapter through initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AdapterState {
    Unconfigured,
    Resetting,
    Configuring,
    NegotiatingProtocol,
    Ready,
    Failed,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Unconfigured => "unconfigured",
            AdapterState::Resetting => "resetting",
            AdapterState::Configuring => "configuring",
            AdapterState::NegotiatingProtocol => "negotiating protocol",
            AdapterState::Ready => "ready",
            AdapterState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Initialization policy
#[derive(Debug, Clone)]
pub struct InitConfig {
    /// Settle time after connecting, and between reset attempts
    pub startup_delay: Duration,
    /// Total reset attempts (capped at 3)
    pub reset_attempts: u32,
    /// Mode-setting commands sent after reset
    pub configure_commands: Vec<String>,
    /// Protocols to try, in order
    pub candidates: Vec<ObdProtocol>,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_millis(1500),
            reset_attempts: 2,
            configure_commands: CONFIGURE_COMMANDS.iter().map(|c| c.to_string()).collect(),
            candidates: DEFAULT_CANDIDATES.to_vec(),
        }
    }
}

/// Drives a fresh connection to [`AdapterState::Ready`]
pub struct AdapterInitializer {
    channel: ElmChannel,
    config: InitConfig,
    state: AdapterState,
}

impl AdapterInitializer {
    pub fn new(connection: Connection, framing: FramingConfig, config: InitConfig) -> Self {
        Self {
            channel: ElmChannel::new(connection, framing),
            config,
            state: AdapterState::Unconfigured,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    /// Run the full handshake.
    ///
    /// On failure the connection is closed before the error is returned.
    pub async fn initialize(mut self) -> Result<ReadyAdapter, HandshakeError> {
        info!("Initializing adapter on {}", self.channel.connection().peer());
        match self.run().await {
            Ok((banner, protocol, detected_protocol)) => {
                self.advance(AdapterState::Ready);
                info!(
                    "Adapter ready: {} on {}{}",
                    banner,
                    protocol,
                    detected_protocol
                        .map(|p| format!(" (detected {p})"))
                        .unwrap_or_default()
                );
                Ok(ReadyAdapter {
                    channel: self.channel,
                    protocol,
                    detected_protocol,
                    banner,
                })
            }
            Err(e) => {
                error!("Adapter initialization failed while {}: {}", self.state, e);
                self.state = AdapterState::Failed;
                self.channel.close().await;
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> Result<(String, ObdProtocol, Option<ObdProtocol>), HandshakeError> {
        let banner = self.reset().await?;
        self.configure().await?;
        let protocol = self.negotiate().await?;
        let detected = if protocol == ObdProtocol::Auto {
            self.describe_protocol().await?
        } else {
            None
        };
        Ok((banner, protocol, detected))
    }

    fn advance(&mut self, next: AdapterState) {
        debug_assert!(next >= self.state, "adapter state moved backwards");
        debug!("Adapter state {} -> {}", self.state, next);
        self.state = next;
    }

    fn abort(&self, e: ObdError) -> HandshakeError {
        HandshakeError::channel(self.state, e)
    }

    async fn reset(&mut self) -> Result<String, HandshakeError> {
        self.advance(AdapterState::Resetting);
        let attempts = self.config.reset_attempts.clamp(1, MAX_STEP_ATTEMPTS);

        for attempt in 1..=attempts {
            debug!(
                "Waiting {}ms for adapter to settle",
                self.config.startup_delay.as_millis()
            );
            tokio::time::sleep(self.config.startup_delay).await;

            // One write per attempt; the attempt loop is the only retry
            match self.channel.exchange(RESET_COMMAND).await {
                Ok(reply) => match find_banner(&reply) {
                    Some(banner) => return Ok(banner),
                    None => warn!(
                        "Reset attempt {}/{}: no banner in {:?}",
                        attempt, attempts, reply
                    ),
                },
                Err(ObdError::CommandTimeout(ms)) => {
                    warn!("Reset attempt {}/{}: no reply in {}ms", attempt, attempts, ms)
                }
                Err(e) => return Err(self.abort(e)),
            }
        }
        Err(HandshakeError::BannerMissing { attempts })
    }

    async fn configure(&mut self) -> Result<(), HandshakeError> {
        self.advance(AdapterState::Configuring);
        for command in self.config.configure_commands.clone() {
            match self.channel.send(&command).await {
                Ok(reply) if framing::acknowledged(&reply) => debug!("{} acknowledged", command),
                Ok(reply) => warn!("{} not acknowledged ({:?}), continuing", command, reply),
                Err(ObdError::CommandTimeout(_)) => warn!("{} timed out, continuing", command),
                Err(e) => return Err(self.abort(e)),
            }
        }
        Ok(())
    }

    async fn negotiate(&mut self) -> Result<ObdProtocol, HandshakeError> {
        self.advance(AdapterState::NegotiatingProtocol);
        let mut tried = Vec::with_capacity(self.config.candidates.len());

        for candidate in self.config.candidates.clone() {
            tried.push(candidate);
            let select = candidate.to_elm_command();
            info!("Trying protocol {} ({})", candidate, select);

            match self.channel.send(&select).await {
                Ok(reply) if framing::acknowledged(&reply) => {}
                Ok(reply) => warn!("{} not acknowledged ({:?})", select, reply),
                Err(ObdError::CommandTimeout(_)) => warn!("{} timed out", select),
                Err(e) => return Err(self.abort(e)),
            }

            match self.channel.send(CANARY_COMMAND).await {
                Ok(reply) => match parser::parse_canary(&reply) {
                    Ok(bitmap) => {
                        info!(
                            "ECU answered canary on {} (supported PIDs {})",
                            candidate,
                            bitmap.iter().map(|b| format!("{b:02X}")).collect::<String>()
                        );
                        return Ok(candidate);
                    }
                    Err(e) => warn!("Canary failed on {}: {}", candidate, e),
                },
                Err(ObdError::CommandTimeout(_)) => warn!("Canary timed out on {}", candidate),
                Err(e) => return Err(self.abort(e)),
            }
        }

        Err(HandshakeError::NoProtocol { tried })
    }

    async fn describe_protocol(&mut self) -> Result<Option<ObdProtocol>, HandshakeError> {
        match self.channel.send(DESCRIBE_PROTOCOL_COMMAND).await {
            Ok(reply) => {
                let detected = ObdProtocol::from_dpn_reply(&reply);
                if detected.is_none() {
                    debug!("Unrecognised protocol description {:?}", reply);
                }
                Ok(detected)
            }
            Err(ObdError::CommandTimeout(_)) => Ok(None),
            Err(e) => Err(self.abort(e)),
        }
    }
}

/// Convenience wrapper around [`AdapterInitializer`]
pub async fn initialize(
    connection: Connection,
    framing: FramingConfig,
    config: InitConfig,
) -> Result<ReadyAdapter, HandshakeError> {
    AdapterInitializer::new(connection, framing, config)
        .initialize()
        .await
}

/// First reply line that identifies an ELM-compatible adapter
fn find_banner(reply: &str) -> Option<String> {
    reply
        .split('\r')
        .map(str::trim)
        .find(|line| {
            let upper = line.to_ascii_uppercase();
            upper.contains("ELM") || upper.contains("OBD")
        })
        .map(str::to_string)
}

/// An adapter that passed the canary request
pub struct ReadyAdapter {
    channel: ElmChannel,
    protocol: ObdProtocol,
    detected_protocol: Option<ObdProtocol>,
    banner: String,
}

impl ReadyAdapter {
    /// Candidate that was locked in
    pub fn protocol(&self) -> ObdProtocol {
        self.protocol
    }

    /// Protocol the adapter reported after an automatic search
    pub fn detected_protocol(&self) -> Option<ObdProtocol> {
        self.detected_protocol
    }

    /// Reset banner, e.g. `ELM327 v1.5`
    pub fn banner(&self) -> &str {
        &self.banner
    }

    pub fn is_open(&self) -> bool {
        self.channel.connection().is_open()
    }

    /// Request and decode one Mode 01 PID
    pub async fn query(&mut self, pid: u8) -> Result<PidResponse, ObdError> {
        self.channel.query(pid).await
    }

    pub async fn close(&mut self) -> bool {
        self.channel.close().await
    }
}

impl fmt::Debug for ReadyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyAdapter")
            .field("connection", self.channel.connection())
            .field("protocol", &self.protocol)
            .field("detected_protocol", &self.detected_protocol)
            .field("banner", &self.banner)
            .finish()
    }
}
