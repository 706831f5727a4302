//! Scriptable ELM327 simulator for tests
//!
//! Runs on one end of a [`tokio::io::duplex`] pair and answers the AT
//! command set the way a v1.5 clone does. Which protocols reach an ECU, what
//! each PID returns and how slowly the adapter answers are all configurable.

use crate::protocol::ObdProtocol;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;

/// What the simulated ECU sends back for one PID request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// A well-formed frame with these data bytes
    Bytes(Vec<u8>),
    /// `NO DATA`
    NoData,
    /// Verbatim text
    Raw(String),
    /// Say nothing at all, not even a prompt
    Silent,
}

impl MockReply {
    /// RPM frame that decodes back to `rpm`
    pub fn rpm(rpm: u32) -> Self {
        let raw = rpm * 4;
        MockReply::Bytes(vec![(raw >> 8) as u8, (raw & 0xFF) as u8])
    }
}

/// Live adapter settings, reset by `ATZ`
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)] // Independent ELM327 protocol flags
struct Settings {
    echo_enabled: bool,
    linefeeds_enabled: bool,
    spaces_enabled: bool,
    headers_enabled: bool,
    protocol: ObdProtocol,
    searched: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            echo_enabled: true,
            linefeeds_enabled: true,
            spaces_enabled: true,
            headers_enabled: false,
            protocol: ObdProtocol::Auto,
            searched: false,
        }
    }
}

impl Settings {
    fn line_ending(&self) -> &'static str {
        if self.linefeeds_enabled {
            "\r\n"
        } else {
            "\r"
        }
    }
}

/// Builder for a simulated adapter
#[derive(Debug, Clone)]
pub struct MockElm327 {
    banner: String,
    working: Vec<ObdProtocol>,
    auto_detect: bool,
    failed_resets: u32,
    reply_delay: Duration,
    rejected: HashSet<String>,
    pid_replies: HashMap<u8, VecDeque<MockReply>>,
}

impl Default for MockElm327 {
    fn default() -> Self {
        Self::new()
    }
}

impl MockElm327 {
    /// An adapter whose ECU answers on CAN 11/500, reachable by auto search
    pub fn new() -> Self {
        Self {
            banner: "ELM327 v1.5".to_string(),
            working: vec![ObdProtocol::Iso15765_4Can11bit500],
            auto_detect: true,
            failed_resets: 0,
            reply_delay: Duration::ZERO,
            rejected: HashSet::new(),
            pid_replies: HashMap::new(),
        }
    }

    pub fn with_banner(mut self, banner: &str) -> Self {
        self.banner = banner.to_string();
        self
    }

    /// Protocols on which the ECU answers. Empty means no ECU at all.
    pub fn with_working_protocols(mut self, protocols: &[ObdProtocol]) -> Self {
        self.working = protocols.to_vec();
        self
    }

    /// Make `ATSP0` searches fail even when an explicit protocol works
    pub fn without_auto_detect(mut self) -> Self {
        self.auto_detect = false;
        self
    }

    /// The first `count` resets answer without a banner
    pub fn with_failed_resets(mut self, count: u32) -> Self {
        self.failed_resets = count;
        self
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Answer `?` to this command, as strict clones do for unknown AT commands
    pub fn rejecting(mut self, command: &str) -> Self {
        self.rejected.insert(command.to_ascii_uppercase());
        self
    }

    /// Queue replies for a PID; once drained the PID answers `NO DATA`
    pub fn with_pid_replies(mut self, pid: u8, replies: Vec<MockReply>) -> Self {
        self.pid_replies.entry(pid).or_default().extend(replies);
        self
    }

    /// Queue RPM readings for PID 0C
    pub fn with_rpm_values(self, values: &[u32]) -> Self {
        let replies = values.iter().map(|&rpm| MockReply::rpm(rpm)).collect();
        self.with_pid_replies(0x0C, replies)
    }

    /// Start serving; returns the host end of the link
    pub fn spawn(self) -> (DuplexStream, MockHandle) {
        let (host, adapter) = tokio::io::duplex(1024);
        let handle = MockHandle::default();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            self.serve(adapter, task_handle.clone()).await;
            task_handle.disconnected.store(true, Ordering::SeqCst);
        });
        (host, handle)
    }

    async fn serve(mut self, mut stream: DuplexStream, handle: MockHandle) {
        let mut settings = Settings::default();
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let command = loop {
                if let Some(pos) = pending.iter().position(|&b| b == b'\r') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&line[..line.len() - 1])
                        .trim()
                        .to_string();
                    if text.is_empty() {
                        continue;
                    }
                    break text;
                }
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => pending.extend_from_slice(&chunk[..n]),
                }
            };

            debug!("mock <- {:?}", command);
            handle.record(&command);
            let reply = self.respond(&mut settings, &command);

            if !self.reply_delay.is_zero() {
                let delay = tokio::time::sleep(self.reply_delay);
                tokio::pin!(delay);
                loop {
                    tokio::select! {
                        _ = &mut delay => break,
                        read = stream.read(&mut chunk) => match read {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                handle.overlaps.fetch_add(1, Ordering::SeqCst);
                                pending.extend_from_slice(&chunk[..n]);
                            }
                        },
                    }
                }
            }

            if let Some(reply) = reply {
                if stream.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }

    fn reachable(&self, protocol: ObdProtocol) -> bool {
        match protocol {
            ObdProtocol::Auto => self.auto_detect && !self.working.is_empty(),
            explicit => self.working.contains(&explicit),
        }
    }

    /// Build the wire reply for one command; `None` means stay silent
    fn respond(&mut self, settings: &mut Settings, command: &str) -> Option<String> {
        let cmd = command.to_ascii_uppercase().replace(' ', "");
        let echo = if settings.echo_enabled {
            format!("{command}\r")
        } else {
            String::new()
        };

        if self.rejected.contains(&cmd) {
            return Some(format!("{echo}?{le}{le}>", le = settings.line_ending()));
        }

        let body = match cmd.as_str() {
            "ATZ" | "ATWS" => {
                if self.failed_resets > 0 {
                    self.failed_resets -= 1;
                    "LV RESET".to_string()
                } else {
                    *settings = Settings::default();
                    let le = settings.line_ending();
                    return Some(format!("{echo}{le}{le}{}{le}{le}>", self.banner));
                }
            }
            "ATI" => self.banner.clone(),
            "ATE0" => ack(|| settings.echo_enabled = false),
            "ATE1" => ack(|| settings.echo_enabled = true),
            "ATL0" => ack(|| settings.linefeeds_enabled = false),
            "ATL1" => ack(|| settings.linefeeds_enabled = true),
            "ATS0" => ack(|| settings.spaces_enabled = false),
            "ATS1" => ack(|| settings.spaces_enabled = true),
            "ATH0" => ack(|| settings.headers_enabled = false),
            "ATH1" => ack(|| settings.headers_enabled = true),
            "ATDPN" => match settings.protocol {
                ObdProtocol::Auto if settings.searched => {
                    format!("A{}", self.working[0].number())
                }
                protocol => protocol.number().to_string(),
            },
            _ if cmd.starts_with("ATSP") => {
                let mut digits = cmd[4..].chars();
                match (digits.next().and_then(ObdProtocol::from_number), digits.next()) {
                    (Some(protocol), None) => {
                        settings.protocol = protocol;
                        settings.searched = false;
                        "OK".to_string()
                    }
                    _ => "?".to_string(),
                }
            }
            _ if cmd.starts_with("ATAT") || cmd.starts_with("ATST") || cmd == "ATD" => {
                "OK".to_string()
            }
            _ if cmd.len() == 4 && cmd.starts_with("01") => {
                match u8::from_str_radix(&cmd[2..], 16) {
                    Ok(pid) => self.pid_reply(settings, pid)?,
                    Err(_) => "?".to_string(),
                }
            }
            _ => "?".to_string(),
        };

        let le = settings.line_ending();
        Some(format!("{echo}{body}{le}{le}>"))
    }

    fn pid_reply(&mut self, settings: &mut Settings, pid: u8) -> Option<String> {
        let le = settings.line_ending();
        if !self.reachable(settings.protocol) {
            let failure = if settings.protocol == ObdProtocol::Auto {
                format!("SEARCHING...{le}UNABLE TO CONNECT")
            } else if settings.protocol.is_can() {
                "CAN ERROR".to_string()
            } else {
                "BUS INIT: ...ERROR".to_string()
            };
            return Some(failure);
        }

        let prefix = if settings.protocol == ObdProtocol::Auto && !settings.searched {
            settings.searched = true;
            format!("SEARCHING...{le}")
        } else {
            String::new()
        };

        let reply = match self.pid_replies.get_mut(&pid) {
            Some(queue) => queue.pop_front().unwrap_or(MockReply::NoData),
            None if pid == 0x00 => MockReply::Bytes(vec![0xBE, 0x3E, 0xB8, 0x11]),
            None => MockReply::NoData,
        };

        let body = match reply {
            MockReply::Bytes(data) => format_frame(settings, pid, &data),
            MockReply::NoData => "NO DATA".to_string(),
            MockReply::Raw(text) => text,
            MockReply::Silent => return None,
        };
        Some(format!("{prefix}{body}"))
    }
}

fn ack(apply: impl FnOnce()) -> String {
    apply();
    "OK".to_string()
}

fn format_frame(settings: &Settings, pid: u8, data: &[u8]) -> String {
    let mut bytes = vec![0x41, pid];
    bytes.extend_from_slice(data);
    if settings.headers_enabled {
        bytes.insert(0, bytes.len() as u8);
    }
    let separator = if settings.spaces_enabled { " " } else { "" };
    let hex: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    let frame = hex.join(separator);
    if settings.headers_enabled {
        format!("7E8{separator}{frame}")
    } else {
        frame
    }
}

/// Observations of a running mock
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    commands: Arc<Mutex<Vec<String>>>,
    overlaps: Arc<AtomicUsize>,
    disconnected: Arc<AtomicBool>,
}

impl MockHandle {
    fn record(&self, command: &str) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.to_string());
        }
    }

    /// Every command received, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// How many times input arrived while a reply was still pending
    pub fn overlapping_writes(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// The host end hung up and the mock stopped serving
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Number of times `command` was received
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| c.as_str() == command).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut mock = MockElm327::new();
        let mut state = settings();
        mock.respond(&mut state, "ATE0");
        mock.respond(&mut state, "ATS0");
        assert!(!state.echo_enabled);

        let reply = mock.respond(&mut state, "ATZ").unwrap();
        assert!(reply.contains("ELM327 v1.5"));
        assert!(state.echo_enabled);
        assert!(state.spaces_enabled);
    }

    #[test]
    fn test_frame_formatting() {
        let mut state = settings();
        assert_eq!(format_frame(&state, 0x0C, &[0x1A, 0xF8]), "41 0C 1A F8");
        state.spaces_enabled = false;
        assert_eq!(format_frame(&state, 0x0C, &[0x1A, 0xF8]), "410C1AF8");
        state.headers_enabled = true;
        assert_eq!(format_frame(&state, 0x0D, &[0x32]), "7E803410D32");
    }

    #[test]
    fn test_unreachable_protocol() {
        let mut mock = MockElm327::new().with_working_protocols(&[]);
        let mut state = settings();
        state.echo_enabled = false;
        let reply = mock.respond(&mut state, "0100").unwrap();
        assert!(reply.contains("UNABLE TO CONNECT"));
    }

    #[test]
    fn test_rpm_queue_then_no_data() {
        let mut mock = MockElm327::new().with_rpm_values(&[750]);
        let mut state = settings();
        state.echo_enabled = false;
        state.protocol = ObdProtocol::Iso15765_4Can11bit500;
        assert!(mock.respond(&mut state, "010C").unwrap().starts_with("41 0C 0B B8"));
        assert!(mock.respond(&mut state, "010C").unwrap().starts_with("NO DATA"));
    }
}
