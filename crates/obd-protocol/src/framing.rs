//! Command/response framing over an ELM327 channel
//!
//! One command is in flight at a time: `send` takes `&mut self` and does not
//! return until the reply is resolved by prompt, inactivity, timeout or error.

use crate::connection::{Connection, DuplexStream};
use crate::error::ObdError;
use crate::parser;
use crate::pid::PidResponse;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Prompt byte the adapter prints when it is ready for the next command
pub const PROMPT: u8 = b'>';

/// Command terminator
pub const TERMINATOR: u8 = b'\r';

/// Upper bound on reads spent discarding stale input before a command
const MAX_DRAIN_READS: usize = 32;

/// Timing and retry policy for the framing layer
#[derive(Debug, Clone)]
pub struct FramingConfig {
    /// Longest time to wait for the prompt
    pub max_wait: Duration,
    /// Silence after some data that ends a reply without a prompt
    pub inactivity: Duration,
    /// How long to listen for leftover bytes before writing a command
    pub drain_window: Duration,
    /// Extra sends allowed for an empty or `?` reply
    pub max_resends: u32,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(6000),
            inactivity: Duration::from_millis(1500),
            drain_window: Duration::from_millis(50),
            max_resends: 2,
        }
    }
}

/// A connection speaking the ELM327 line protocol
pub struct ElmChannel {
    connection: Connection,
    config: FramingConfig,
}

impl ElmChannel {
    pub fn new(connection: Connection, config: FramingConfig) -> Self {
        Self { connection, config }
    }

    pub fn config(&self) -> &FramingConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Release the transport. Idempotent.
    pub async fn close(&mut self) -> bool {
        self.connection.close().await
    }

    /// Send a command, resending a bounded number of times when the reply
    /// is empty or a syntax error.
    ///
    /// Exhausted resends hand back the last reply (possibly empty) or the
    /// last timeout; the caller decides what that means.
    pub async fn send(&mut self, command: &str) -> Result<String, ObdError> {
        let mut resends = 0;
        loop {
            let outcome = self.exchange(command).await;
            let retry = match &outcome {
                Ok(reply) => needs_resend(reply),
                Err(ObdError::CommandTimeout(_)) => true,
                Err(_) => false,
            };
            if !retry {
                return outcome;
            }
            if resends >= self.config.max_resends {
                warn!("{:?} unanswered after {} resends", command, resends);
                return outcome;
            }
            resends += 1;
            warn!(
                "Resending {:?} ({}/{})",
                command, resends, self.config.max_resends
            );
        }
    }

    /// Request a Mode 01 PID and decode the reply
    pub async fn query(&mut self, pid: u8) -> Result<PidResponse, ObdError> {
        let reply = self.send(&format!("01{:02X}", pid)).await?;
        let response = parser::parse_response(&reply, pid)?;
        debug!("PID {:02X} = {}", pid, response.value);
        Ok(response)
    }

    /// One write and one reply, no resends
    pub async fn exchange(&mut self, command: &str) -> Result<String, ObdError> {
        let result = self.exchange_inner(command).await;
        if let Err(ObdError::ConnectionClosed) = result {
            // Peer is gone; make every later send fail fast.
            self.connection.close().await;
        }
        result
    }

    async fn exchange_inner(&mut self, command: &str) -> Result<String, ObdError> {
        let Self { connection, config } = self;
        let stream = connection.stream_mut()?;

        discard_stale(stream, config.drain_window).await?;

        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(TERMINATOR);

        debug!("-> {:?}", command);
        stream.write_all(&line).await?;
        stream.flush().await?;

        let raw = read_reply(stream, config).await?;
        let reply = clean_reply(&raw, command);
        debug!("<- {:?}", reply);
        Ok(reply)
    }
}

/// Read and drop anything left over from an earlier exchange
async fn discard_stale(
    stream: &mut (dyn DuplexStream + 'static),
    window: Duration,
) -> Result<usize, ObdError> {
    if window.is_zero() {
        return Ok(0);
    }
    let mut chunk = [0u8; 128];
    let mut discarded = 0;
    for _ in 0..MAX_DRAIN_READS {
        match timeout(window, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(ObdError::ConnectionClosed),
            Ok(Ok(n)) => discarded += n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }
    if discarded > 0 {
        warn!("Discarded {} stale bytes before command", discarded);
    }
    Ok(discarded)
}

/// Accumulate bytes until the prompt, the wait window, or line inactivity
async fn read_reply(
    stream: &mut (dyn DuplexStream + 'static),
    config: &FramingConfig,
) -> Result<Vec<u8>, ObdError> {
    let deadline = Instant::now() + config.max_wait;
    let mut buf = Vec::with_capacity(64);
    let mut chunk = [0u8; 128];

    loop {
        let now = Instant::now();
        if now >= deadline {
            if buf.is_empty() {
                return Err(ObdError::CommandTimeout(config.max_wait.as_millis() as u64));
            }
            warn!(
                "No prompt within {}ms, using {} partial bytes",
                config.max_wait.as_millis(),
                buf.len()
            );
            return Ok(buf);
        }

        let remaining = deadline - now;
        let wait = if buf.is_empty() {
            remaining
        } else {
            remaining.min(config.inactivity)
        };

        match timeout(wait, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(ObdError::ConnectionClosed),
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.iter().position(|&b| b == PROMPT) {
                    if pos + 1 < buf.len() {
                        debug!("Dropping {} bytes after prompt", buf.len() - pos - 1);
                    }
                    buf.truncate(pos);
                    return Ok(buf);
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            // Nothing yet: the deadline check above ends the wait
            Err(_) if buf.is_empty() => {}
            Err(_) => {
                debug!("Line idle, accepting {} bytes without prompt", buf.len());
                return Ok(buf);
            }
        }
    }
}

/// Trim whitespace and NULs, drop blank lines and a leading command echo
fn clean_reply(raw: &[u8], command: &str) -> String {
    let text = String::from_utf8_lossy(raw).replace('\0', "");
    let mut lines: Vec<&str> = text
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines
        .first()
        .is_some_and(|line| line.eq_ignore_ascii_case(command))
    {
        lines.remove(0);
    }
    lines.join("\r")
}

fn is_syntax_error(reply: &str) -> bool {
    reply.split('\r').any(|line| line.trim() == "?")
}

fn is_ack(reply: &str) -> bool {
    reply
        .split('\r')
        .any(|line| line.trim().eq_ignore_ascii_case("OK"))
}

/// Whether a reply already shows the command got through
fn has_frame_evidence(reply: &str) -> bool {
    is_ack(reply) || parser::has_mode01_frame(reply)
}

fn needs_resend(reply: &str) -> bool {
    (reply.is_empty() || is_syntax_error(reply)) && !has_frame_evidence(reply)
}

/// Whether an AT command reply acknowledges it
pub fn acknowledged(reply: &str) -> bool {
    is_ack(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockElm327;
    use tokio::io::DuplexStream as Peer;

    fn channel(stream: Peer, config: FramingConfig) -> ElmChannel {
        ElmChannel::new(Connection::new(stream, "test"), config)
    }

    /// Read one CR-terminated command from the adapter side
    async fn read_command(peer: &mut Peer) -> Option<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match peer.read(&mut byte).await {
                Ok(0) | Err(_) => return None,
                Ok(_) if byte[0] == b'\r' => return Some(String::from_utf8_lossy(&line).into_owned()),
                Ok(_) => line.push(byte[0]),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_stripped_of_prompt_and_whitespace() {
        let (client, mut peer) = tokio::io::duplex(256);
        let responder = tokio::spawn(async move {
            let command = read_command(&mut peer).await;
            peer.write_all(b"\r\n41 0C 1A F8 \r\r>").await.unwrap();
            command
        });

        let mut channel = channel(client, FramingConfig::default());
        let reply = channel.send("010C").await.unwrap();
        assert_eq!(reply, "41 0C 1A F8");
        assert_eq!(responder.await.unwrap().as_deref(), Some("010C"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_dropped() {
        let (client, mut peer) = tokio::io::duplex(256);
        tokio::spawn(async move {
            read_command(&mut peer).await;
            peer.write_all(b"ATE0\rOK\r\r>").await.unwrap();
        });

        let mut channel = channel(client, FramingConfig::default());
        assert_eq!(channel.send("ATE0").await.unwrap(), "OK");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_adapter_times_out_after_resends() {
        let (client, mut peer) = tokio::io::duplex(256);
        let responder = tokio::spawn(async move {
            let mut seen = 0;
            while read_command(&mut peer).await.is_some() {
                seen += 1;
            }
            seen
        });

        let mut channel = channel(client, FramingConfig::default());
        let started = Instant::now();
        let result = channel.send("010C").await;
        assert!(matches!(result, Err(ObdError::CommandTimeout(6000))));
        assert!(started.elapsed() >= Duration::from_millis(3 * 6000));

        drop(channel);
        assert_eq!(responder.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_ends_reply_without_prompt() {
        let (client, mut peer) = tokio::io::duplex(256);
        tokio::spawn(async move {
            read_command(&mut peer).await;
            peer.write_all(b"41 0C 1A F8").await.unwrap();
            // Keep the line open without ever sending a prompt
            read_command(&mut peer).await;
        });

        let config = FramingConfig::default();
        let mut channel = channel(client, config.clone());
        let started = Instant::now();
        let reply = channel.send("010C").await.unwrap();
        assert_eq!(reply, "41 0C 1A F8");
        assert!(started.elapsed() < config.max_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_syntax_error_resent() {
        let (client, mut peer) = tokio::io::duplex(256);
        let responder = tokio::spawn(async move {
            let mut commands = Vec::new();
            commands.push(read_command(&mut peer).await);
            peer.write_all(b"?\r\r>").await.unwrap();
            commands.push(read_command(&mut peer).await);
            peer.write_all(b"OK\r\r>").await.unwrap();
            commands
        });

        let mut channel = channel(client, FramingConfig::default());
        assert_eq!(channel.send("ATAT1").await.unwrap(), "OK");
        let commands = responder.await.unwrap();
        assert_eq!(commands.len(), 2);
        assert!(commands.iter().all(|c| c.as_deref() == Some("ATAT1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_bytes_discarded_before_write() {
        let (client, mut peer) = tokio::io::duplex(256);
        peer.write_all(b"410C0000\r\r>").await.unwrap();
        tokio::spawn(async move {
            read_command(&mut peer).await;
            peer.write_all(b"410C1AF8\r\r>").await.unwrap();
        });

        let mut channel = channel(client, FramingConfig::default());
        let response = channel.query(0x0C).await.unwrap();
        assert_eq!(response.value, 1726);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_adapter_never_sees_overlapping_commands() {
        let (client, handle) = MockElm327::new()
            .with_reply_delay(Duration::from_millis(2000))
            .spawn();

        let mut channel = channel(client, FramingConfig::default());
        for command in ["ATE0", "ATL0", "ATS0", "0100"] {
            channel.send(command).await.unwrap();
        }

        assert_eq!(handle.commands(), vec!["ATE0", "ATL0", "ATS0", "0100"]);
        assert_eq!(handle.overlapping_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_hangup_closes_connection() {
        let (client, peer) = tokio::io::duplex(256);
        drop(peer);

        let mut channel = channel(client, FramingConfig::default());
        assert!(matches!(channel.send("ATZ").await, Err(ObdError::ConnectionClosed)));
        assert!(!channel.connection().is_open());
        assert!(matches!(channel.send("ATZ").await, Err(ObdError::ConnectionClosed)));
    }

    #[test]
    fn test_resend_rules() {
        assert!(needs_resend(""));
        assert!(needs_resend("?"));
        assert!(!needs_resend("NO DATA"));
        assert!(!needs_resend("?\r41 0C 1A F8"));
        assert!(!needs_resend("OK"));
    }
}
