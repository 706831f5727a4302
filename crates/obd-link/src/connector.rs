//! Device Connector: RFCOMM connect with retry, backoff and insecure fallback

use crate::device::DeviceRef;
use crate::error::ConnectionError;
use crate::opener::{ChannelSecurity, RfcommOpener};
use obd_protocol::Connection;
use std::io;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Connection retry policy
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Secure attempts before giving up (at least 1)
    pub max_retries: u32,
    /// Wait after each failed attempt
    pub backoff: Duration,
    /// Try one insecure channel after the last secure failure
    pub insecure_fallback: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(1000),
            insecure_fallback: true,
        }
    }
}

/// Opens connections through an [`RfcommOpener`]
pub struct DeviceConnector<O> {
    opener: O,
    config: ConnectConfig,
}

impl<O: RfcommOpener> DeviceConnector<O> {
    pub fn new(opener: O, config: ConnectConfig) -> Self {
        Self { opener, config }
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Connect to `device`, making at most `max_retries` secure attempts
    /// and then, if enabled, one insecure one.
    ///
    /// `preferred` falls back to the device's own preferred service, which
    /// in turn falls back to SPP.
    pub async fn connect(
        &self,
        device: &DeviceRef,
        preferred: Option<Uuid>,
        max_retries: u32,
    ) -> Result<Connection, ConnectionError> {
        if max_retries == 0 {
            return Err(ConnectionError::InvalidRetryCount);
        }
        if !self.opener.is_bonded(device) {
            return Err(ConnectionError::NotBonded(device.address().to_string()));
        }

        let service = preferred.unwrap_or_else(|| device.preferred_service());
        info!("Connecting to {} with service {}", device.label(), service);

        let mut last_error = None;
        for attempt in 1..=max_retries {
            info!("Connection attempt {}/{}", attempt, max_retries);
            match self.opener.open(device, service, ChannelSecurity::Secure).await {
                Ok(stream) => {
                    info!("Connected to {} on attempt {}", device.label(), attempt);
                    return Ok(Connection::new(stream, device.label()));
                }
                Err(e) => {
                    warn!("Attempt {}/{} failed: {}", attempt, max_retries, e);
                    last_error = Some(e);
                }
            }
            if attempt < max_retries {
                tokio::time::sleep(self.config.backoff).await;
            }
        }

        let mut attempts = max_retries;
        if self.config.insecure_fallback {
            tokio::time::sleep(self.config.backoff).await;
            attempts += 1;
            warn!("Secure attempts exhausted, trying insecure channel to {}", device.label());
            match self.opener.open(device, service, ChannelSecurity::Insecure).await {
                Ok(stream) => {
                    info!("Connected to {} over insecure channel", device.label());
                    return Ok(Connection::new(stream, device.label()));
                }
                Err(e) => {
                    warn!("Insecure attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(ConnectionError::Exhausted {
            address: device.address().to_string(),
            attempts,
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no attempt made")),
        })
    }

    /// [`connect`](Self::connect) with the configured retry count
    pub async fn connect_with_defaults(
        &self,
        device: &DeviceRef,
        preferred: Option<Uuid>,
    ) -> Result<Connection, ConnectionError> {
        self.connect(device, preferred, self.config.max_retries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SPP_UUID;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    type Calls = Arc<Mutex<Vec<(Uuid, ChannelSecurity, Instant)>>>;

    /// Fails the first `secure_failures` secure opens; insecure opens
    /// succeed unless `insecure_fails`.
    #[derive(Clone, Default)]
    struct ScriptedOpener {
        secure_failures: usize,
        insecure_fails: bool,
        bonded: Option<bool>,
        calls: Calls,
    }

    impl ScriptedOpener {
        fn calls(&self) -> Vec<(Uuid, ChannelSecurity, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RfcommOpener for ScriptedOpener {
        type Stream = DuplexStream;

        fn is_bonded(&self, _device: &DeviceRef) -> bool {
            self.bonded.unwrap_or(true)
        }

        async fn open(
            &self,
            _device: &DeviceRef,
            service: Uuid,
            security: ChannelSecurity,
        ) -> io::Result<DuplexStream> {
            let secure_so_far = {
                let mut calls = self.calls.lock().unwrap();
                let secure_so_far = calls
                    .iter()
                    .filter(|(_, s, _)| *s == ChannelSecurity::Secure)
                    .count();
                calls.push((service, security, Instant::now()));
                secure_so_far
            };
            let fail = match security {
                ChannelSecurity::Secure => secure_so_far < self.secure_failures,
                ChannelSecurity::Insecure => self.insecure_fails,
            };
            if fail {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "page timeout"))
            } else {
                Ok(tokio::io::duplex(64).0)
            }
        }
    }

    fn connector(opener: &ScriptedOpener, insecure_fallback: bool) -> DeviceConnector<ScriptedOpener> {
        DeviceConnector::new(
            opener.clone(),
            ConnectConfig {
                insecure_fallback,
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff() {
        let opener = ScriptedOpener {
            secure_failures: 2,
            ..Default::default()
        };
        let device = DeviceRef::new("AA:BB");
        let connection = connector(&opener, true)
            .connect(&device, None, 3)
            .await
            .unwrap();
        assert!(connection.is_open());

        let calls = opener.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(id, s, _)| *id == SPP_UUID && *s == ChannelSecurity::Secure));
        assert!(calls
            .windows(2)
            .all(|w| w[1].2 - w[0].2 >= Duration::from_millis(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_insecure_fallback() {
        let opener = ScriptedOpener {
            secure_failures: usize::MAX,
            ..Default::default()
        };
        let result = connector(&opener, true)
            .connect(&DeviceRef::new("AA:BB"), None, 3)
            .await;
        assert!(result.is_ok());

        let securities: Vec<ChannelSecurity> = opener.calls().iter().map(|c| c.1).collect();
        assert_eq!(
            securities,
            vec![
                ChannelSecurity::Secure,
                ChannelSecurity::Secure,
                ChannelSecurity::Secure,
                ChannelSecurity::Insecure,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted() {
        let opener = ScriptedOpener {
            secure_failures: usize::MAX,
            insecure_fails: true,
            ..Default::default()
        };
        let result = connector(&opener, true)
            .connect(&DeviceRef::new("AA:BB"), None, 2)
            .await;
        match result {
            Err(ConnectionError::Exhausted { address, attempts, .. }) => {
                assert_eq!(address, "AA:BB");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(opener.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_disabled() {
        let opener = ScriptedOpener {
            secure_failures: usize::MAX,
            ..Default::default()
        };
        let started = Instant::now();
        let result = connector(&opener, false)
            .connect(&DeviceRef::new("AA:BB"), None, 3)
            .await;
        assert!(matches!(result, Err(ConnectionError::Exhausted { attempts: 3, .. })));
        assert_eq!(opener.calls().len(), 3);
        // Backoff only between attempts, not after the last one
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preferred_service_used() {
        let opener = ScriptedOpener::default();
        let discovered = Uuid::from_u128(0xFEED);
        let device = DeviceRef::new("AA:BB").with_discovered_service(discovered);
        let explicit = Uuid::from_u128(0xBEEF);

        let connector = connector(&opener, true);
        connector.connect(&device, None, 1).await.unwrap();
        connector.connect(&device, Some(explicit), 1).await.unwrap();

        let services: Vec<Uuid> = opener.calls().iter().map(|c| c.0).collect();
        assert_eq!(services, vec![discovered, explicit]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_arguments() {
        let opener = ScriptedOpener::default();
        let result = connector(&opener, true)
            .connect(&DeviceRef::new("AA:BB"), None, 0)
            .await;
        assert!(matches!(result, Err(ConnectionError::InvalidRetryCount)));

        let unbonded = ScriptedOpener {
            bonded: Some(false),
            ..Default::default()
        };
        let result = connector(&unbonded, true)
            .connect(&DeviceRef::new("AA:BB"), None, 3)
            .await;
        assert!(matches!(result, Err(ConnectionError::NotBonded(_))));
        assert!(opener.calls().is_empty());
        assert!(unbonded.calls().is_empty());
    }
}
