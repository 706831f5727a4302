//! PID Polling Loop

use crate::event::PollEvent;
use obd_protocol::{ObdError, Pid, ReadyAdapter};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for the polling loop
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Mode 01 PID to request each cycle (default: RPM)
    pub pid: u8,
    /// Delay between cycles, applied after every cycle
    pub interval: Duration,
    /// Consecutive failed cycles that stop the loop
    pub error_threshold: u32,
    /// Event channel capacity
    pub channel_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            pid: Pid::Rpm.as_hex(),
            interval: Duration::from_millis(1000),
            error_threshold: 10,
            channel_capacity: 32,
        }
    }
}

/// Why a polling loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Unresponsive,
    ConnectionLost,
    /// Nobody is listening for events any more
    ReceiverDropped,
}

/// Errors from the polling task itself
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Polling task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Counters for one run of the polling loop
#[derive(Debug, Clone)]
pub struct PollingSession {
    config: PollerConfig,
    consecutive_errors: u32,
    last_good: Option<u32>,
    cycles: u64,
    stopped: bool,
}

impl PollingSession {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            consecutive_errors: 0,
            last_good: None,
            cycles: 0,
            stopped: false,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Most recent decoded value
    pub fn last_good(&self) -> Option<u32> {
        self.last_good
    }

    /// Cycles that issued a request
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn record_success(&mut self, value: u32) {
        self.consecutive_errors = 0;
        self.last_good = Some(value);
    }

    /// Count a failed cycle; returns `true` once the threshold is reached
    fn record_failure(&mut self) -> bool {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.config.error_threshold.max(1) {
            self.stopped = true;
        }
        self.stopped
    }

    /// Poll until cancelled, the threshold is hit, the connection drops,
    /// or the event receiver goes away.
    ///
    /// Cancellation is checked at the top of each cycle, so an exchange in
    /// progress always completes.
    pub async fn run(
        &mut self,
        adapter: &mut ReadyAdapter,
        events: &mpsc::Sender<PollEvent>,
        cancel: &mut watch::Receiver<bool>,
    ) -> StopReason {
        let pid = self.config.pid;
        info!(
            "Polling PID {:02X} every {}ms (threshold {})",
            pid,
            self.config.interval.as_millis(),
            self.config.error_threshold
        );

        loop {
            if *cancel.borrow() {
                info!("Polling cancelled after {} cycles", self.cycles);
                return StopReason::Cancelled;
            }

            if !adapter.is_open() {
                return self.connection_lost(events, cancel).await;
            }

            self.cycles += 1;
            let event = match adapter.query(pid).await {
                Ok(response) => {
                    self.record_success(response.value);
                    debug!("Cycle {}: PID {:02X} = {}", self.cycles, pid, response.value);
                    PollEvent::Value {
                        pid: response.pid,
                        value: response.value,
                        timestamp_ms: response.timestamp_ms,
                    }
                }
                Err(e) if e.is_connection_lost() => return self.connection_lost(events, cancel).await,
                Err(e) => {
                    let terminal = self.record_failure();
                    warn!(
                        "Cycle {}: PID {:02X} failed ({}/{}): {}",
                        self.cycles, pid, self.consecutive_errors, self.config.error_threshold, e
                    );
                    if terminal {
                        let unresponsive = ObdError::AdapterUnresponsive(self.consecutive_errors);
                        error!("{}", unresponsive);
                        let event = PollEvent::Unresponsive {
                            consecutive_errors: self.consecutive_errors,
                        };
                        return match emit(events, cancel, event).await {
                            Err(StopReason::Cancelled) => StopReason::Cancelled,
                            _ => StopReason::Unresponsive,
                        };
                    }
                    PollEvent::Waiting {
                        consecutive_errors: self.consecutive_errors,
                    }
                }
            };

            if let Err(reason) = emit(events, cancel, event).await {
                return reason;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() {
                        info!("Poller handle dropped, stopping");
                        return StopReason::Cancelled;
                    }
                }
            }
        }
    }

    async fn connection_lost(
        &mut self,
        events: &mpsc::Sender<PollEvent>,
        cancel: &mut watch::Receiver<bool>,
    ) -> StopReason {
        error!("Connection lost after {} cycles", self.cycles);
        self.stopped = true;
        let _ = emit(events, cancel, PollEvent::ConnectionLost).await;
        StopReason::ConnectionLost
    }
}

/// Deliver one event, giving up if the loop is cancelled while the channel
/// is full
async fn emit(
    events: &mpsc::Sender<PollEvent>,
    cancel: &mut watch::Receiver<bool>,
    event: PollEvent,
) -> Result<(), StopReason> {
    tokio::select! {
        biased;
        sent = events.send(event) => sent.map_err(|_| {
            info!("Event receiver dropped, stopping poller");
            StopReason::ReceiverDropped
        }),
        _ = cancel.changed() => {
            info!("Cancelled with undelivered event");
            Err(StopReason::Cancelled)
        }
    }
}

/// Everything handed back when the polling task finishes
#[derive(Debug)]
pub struct PollOutcome {
    pub adapter: ReadyAdapter,
    pub session: PollingSession,
    pub reason: StopReason,
}

/// Handle to a polling loop running on its own task
pub struct Poller {
    cancel: watch::Sender<bool>,
    task: JoinHandle<PollOutcome>,
}

impl Poller {
    /// Start polling `adapter` on a dedicated task
    pub fn spawn(mut adapter: ReadyAdapter, config: PollerConfig) -> (Self, mpsc::Receiver<PollEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut session = PollingSession::new(config);
            let reason = session.run(&mut adapter, &events_tx, &mut cancel_rx).await;
            info!("Poller stopped: {:?}", reason);
            PollOutcome {
                adapter,
                session,
                reason,
            }
        });

        (Self { cancel: cancel_tx, task }, events_rx)
    }

    /// Ask the loop to stop at the top of its next cycle
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end on its own
    pub async fn join(self) -> Result<PollOutcome, SchedulerError> {
        Ok(self.task.await?)
    }

    /// Cancel and wait for the in-flight cycle to finish
    pub async fn stop(self) -> Result<PollOutcome, SchedulerError> {
        self.cancel();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::{MockElm327, MockHandle, MockReply};
    use obd_protocol::{initialize, Connection, FramingConfig, InitConfig};
    use tokio::time::Instant;

    async fn ready(mock: MockElm327) -> (ReadyAdapter, MockHandle) {
        let (stream, handle) = mock.spawn();
        let adapter = initialize(
            Connection::new(stream, "mock"),
            FramingConfig::default(),
            InitConfig::default(),
        )
        .await
        .unwrap();
        (adapter, handle)
    }

    fn config(threshold: u32) -> PollerConfig {
        PollerConfig {
            error_threshold: threshold,
            ..Default::default()
        }
    }

    #[test]
    fn test_threshold_counting() {
        let mut session = PollingSession::new(config(3));
        assert!(!session.record_failure());
        assert!(!session.record_failure());
        session.record_success(800);
        assert_eq!(session.consecutive_errors(), 0);
        assert!(!session.record_failure());
        assert!(!session.record_failure());
        assert!(session.record_failure());
        assert!(session.is_stopped());
        assert_eq!(session.last_good(), Some(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_emitted_at_fixed_cadence() {
        let (adapter, _handle) = ready(MockElm327::new().with_rpm_values(&[750, 812, 790])).await;
        let (poller, mut events) = Poller::spawn(adapter, config(10));

        let mut values = Vec::new();
        let mut arrivals = Vec::new();
        while values.len() < 3 {
            match events.recv().await.unwrap() {
                PollEvent::Value { value, .. } => {
                    values.push(value);
                    arrivals.push(Instant::now());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        let outcome = poller.stop().await.unwrap();
        assert_eq!(values, vec![750, 812, 790]);
        assert!(arrivals
            .windows(2)
            .all(|w| w[1] - w[0] >= Duration::from_millis(1000)));
        assert_eq!(outcome.reason, StopReason::Cancelled);
        assert_eq!(outcome.session.consecutive_errors(), 0);
        assert_eq!(outcome.session.last_good(), Some(790));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_threshold() {
        let (adapter, handle) = ready(MockElm327::new()).await;
        let (poller, mut events) = Poller::spawn(adapter, config(3));

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            received.push(event);
        }

        assert_eq!(
            received,
            vec![
                PollEvent::Waiting { consecutive_errors: 1 },
                PollEvent::Waiting { consecutive_errors: 2 },
                PollEvent::Unresponsive { consecutive_errors: 3 },
            ]
        );
        let outcome = poller.join().await.unwrap();
        assert_eq!(outcome.reason, StopReason::Unresponsive);
        assert_eq!(handle.count("010C"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let replies = vec![
            MockReply::NoData,
            MockReply::NoData,
            MockReply::rpm(800),
            MockReply::Raw("41 0C 1A".to_string()),
            MockReply::NoData,
            MockReply::NoData,
        ];
        let (adapter, _handle) = ready(MockElm327::new().with_pid_replies(0x0C, replies)).await;
        let (poller, mut events) = Poller::spawn(adapter, config(3));

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            received.push(event.status());
        }

        use crate::event::LinkStatus::*;
        assert_eq!(
            received,
            vec![
                WaitingForData,
                WaitingForData,
                Reading(800),
                WaitingForData,
                WaitingForData,
                ConnectionProblems,
            ]
        );
        assert_eq!(poller.join().await.unwrap().reason, StopReason::Unresponsive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_stops_requests() {
        let (mut adapter, handle) = ready(MockElm327::new().with_rpm_values(&[750])).await;
        assert!(adapter.close().await);

        let (poller, mut events) = Poller::spawn(adapter, config(10));
        assert_eq!(events.recv().await, Some(PollEvent::ConnectionLost));
        assert_eq!(events.recv().await, None);

        let outcome = poller.join().await.unwrap();
        assert_eq!(outcome.reason, StopReason::ConnectionLost);
        assert_eq!(handle.count("010C"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_full_unread_channel() {
        let (adapter, _handle) = ready(MockElm327::new()).await;
        let config = PollerConfig {
            error_threshold: 100,
            channel_capacity: 2,
            ..Default::default()
        };
        let (poller, _events) = Poller::spawn(adapter, config);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let outcome = tokio::time::timeout(Duration::from_secs(60), poller.stop())
            .await
            .expect("stop must not wait on the event channel")
            .unwrap();
        assert_eq!(outcome.reason, StopReason::Cancelled);
        assert!(outcome.adapter.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_cycle() {
        let (adapter, handle) = ready(MockElm327::new()).await;
        let (poller, _events) = Poller::spawn(adapter, config(10));

        let outcome = poller.stop().await.unwrap();
        assert_eq!(outcome.reason, StopReason::Cancelled);
        assert_eq!(outcome.session.cycles(), 0);
        assert!(outcome.adapter.is_open());
        assert_eq!(handle.count("010C"), 0);
    }
}
