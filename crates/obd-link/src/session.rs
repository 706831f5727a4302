//! Link session lifecycle
//!
//! Connector, then initializer, then polling loop. A session holds at most
//! one live connection: starting again tears the previous link down first.

use crate::connector::{ConnectConfig, DeviceConnector};
use crate::device::DeviceRef;
use crate::error::SessionError;
use crate::opener::RfcommOpener;
use obd_protocol::{initialize, FramingConfig, InitConfig, ObdProtocol};
use obd_scheduler::{PollEvent, Poller, PollerConfig, StopReason};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

/// Policy for every stage of a link
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub connect: ConnectConfig,
    pub framing: FramingConfig,
    pub init: InitConfig,
    pub poller: PollerConfig,
}

/// A link that reached polling
#[derive(Debug)]
pub struct LinkStarted {
    /// Identification line from the adapter's reset reply
    pub banner: String,
    /// Candidate the adapter was locked to
    pub protocol: ObdProtocol,
    /// Protocol reported by the adapter after an automatic search
    pub detected_protocol: Option<ObdProtocol>,
    /// Events from the polling task
    pub events: mpsc::Receiver<PollEvent>,
}

pub struct LinkSession<O> {
    connector: DeviceConnector<O>,
    config: SessionConfig,
    active: Option<Poller>,
}

impl<O: RfcommOpener> LinkSession<O> {
    pub fn new(opener: O, config: SessionConfig) -> Self {
        Self {
            connector: DeviceConnector::new(opener, config.connect.clone()),
            config,
            active: None,
        }
    }

    pub fn opener(&self) -> &O {
        self.connector.opener()
    }

    /// A polling task is attached, possibly already finished on its own
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Connect to `device`, initialize the adapter and start polling.
    ///
    /// Any live link is stopped and closed before the first connection
    /// attempt. On error nothing is left open.
    pub async fn start(
        &mut self,
        device: &DeviceRef,
        preferred: Option<Uuid>,
    ) -> Result<LinkStarted, SessionError> {
        if let Some(reason) = self.stop().await? {
            info!("Previous link stopped ({:?}) before reconnecting", reason);
        }

        let connection = self
            .connector
            .connect(device, preferred, self.config.connect.max_retries)
            .await
            .map_err(|e| {
                error!("Connection to {} rejected: {}", device.label(), e);
                e
            })?;

        let adapter = initialize(
            connection,
            self.config.framing.clone(),
            self.config.init.clone(),
        )
        .await?;

        let banner = adapter.banner().to_string();
        let protocol = adapter.protocol();
        let detected_protocol = adapter.detected_protocol();

        let (poller, events) = Poller::spawn(adapter, self.config.poller.clone());
        self.active = Some(poller);
        info!("Link to {} started on {}", device.label(), protocol);

        Ok(LinkStarted {
            banner,
            protocol,
            detected_protocol,
            events,
        })
    }

    /// Stop polling and close the connection.
    ///
    /// Returns why the polling loop ended, or `None` if nothing was running.
    pub async fn stop(&mut self) -> Result<Option<StopReason>, SessionError> {
        let Some(poller) = self.active.take() else {
            return Ok(None);
        };

        let mut outcome = poller.stop().await?;
        outcome.adapter.close().await;
        info!(
            "Link stopped after {} cycles: {:?}",
            outcome.session.cycles(),
            outcome.reason
        );
        Ok(Some(outcome.reason))
    }
}
