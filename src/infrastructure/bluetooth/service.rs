//! Session Service
//!
//! Facade coordinating the scanner, the connection session and the
//! communication channel against one radio and one event sink. This is
//! the surface a UI talks to: every method returns immediately (the
//! blocking ones only wait for task termination, never for the radio),
//! and every outcome arrives through the sink.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::events::EventSink;
use crate::domain::models::{
    DeviceAddress, DiscoveredDevice, NotificationSubscription, SessionSnapshot,
};
use crate::domain::settings::Settings;
use crate::error::CoreError;
use crate::infrastructure::bluetooth::channel::CommunicationChannel;
use crate::infrastructure::bluetooth::connection::ConnectionSession;
use crate::infrastructure::bluetooth::radio::RadioLink;
use crate::infrastructure::bluetooth::scanner::ScanController;
use crate::infrastructure::bridge::AsyncBridge;

pub struct BleSessionService {
    bridge: Arc<AsyncBridge>,
    radio: Arc<dyn RadioLink>,
    scanner: ScanController,
    session: Arc<ConnectionSession>,
    channel: CommunicationChannel,
    settings: Settings,
}

impl BleSessionService {
    /// Builds the core against a radio implementation and the caller's
    /// sink. The worker context starts immediately.
    pub fn new(
        radio: Arc<dyn RadioLink>,
        sink: Arc<dyn EventSink>,
        settings: Settings,
    ) -> Result<Self, CoreError> {
        let bridge = Arc::new(AsyncBridge::new(sink.clone())?);
        let gate = Arc::new(tokio::sync::Mutex::new(()));

        let session = Arc::new(ConnectionSession::new(
            radio.clone(),
            bridge.clone(),
            gate.clone(),
            sink.clone(),
            settings.connect_timeout(),
        ));
        let scanner = ScanController::new(
            session.shared(),
            radio.clone(),
            bridge.clone(),
            gate.clone(),
            sink.clone(),
            settings.scan_round_timeout(),
            settings.scan_round_interval(),
        );
        let channel = CommunicationChannel::new(
            session.clone(),
            bridge.clone(),
            gate,
            sink,
            settings.poll_interval(),
        );

        Ok(Self {
            bridge,
            radio,
            scanner,
            session,
            channel,
            settings,
        })
    }

    pub fn start_scan(&self) -> Result<(), CoreError> {
        self.scanner.start_scan()
    }

    pub fn stop_scan(&self) {
        self.scanner.stop_scan()
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.scanner.devices()
    }

    /// Starts a connection attempt. Scanning and connecting contend for
    /// the radio, so any active scan is stopped before the attempt.
    pub fn connect(&self, address: impl Into<DeviceAddress>) -> Result<(), CoreError> {
        let address = address.into();
        self.session.begin_connect(address.clone())?;
        self.scanner.stop_scan();
        self.session.spawn_connect(address);
        Ok(())
    }

    /// Tears the session down from whatever state it is in and blocks
    /// until no background work for it remains.
    pub fn disconnect(&self) {
        self.session.disconnect()
    }

    pub fn pair(&self) -> Result<(), CoreError> {
        self.session.pair()
    }

    pub fn unpair(&self) -> Result<(), CoreError> {
        self.session.unpair()
    }

    pub fn discover_services(&self) -> Result<(), CoreError> {
        self.session.discover_services()
    }

    pub fn read(&self, characteristic: Uuid) -> Result<(), CoreError> {
        self.channel.read(characteristic)
    }

    pub fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), CoreError> {
        self.channel.write(characteristic, payload)
    }

    pub fn subscribe(&self, characteristic: Uuid) -> Result<(), CoreError> {
        self.channel.subscribe(characteristic)
    }

    pub fn unsubscribe(&self, characteristic: Uuid) {
        self.channel.unsubscribe(characteristic)
    }

    pub fn subscription(&self, characteristic: Uuid) -> Option<NotificationSubscription> {
        self.channel.subscription(characteristic)
    }

    pub fn subscription_count(&self) -> usize {
        self.channel.subscription_count()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Orderly end of the core: stops discovery, tears the session
    /// down, removes any bond created during this process and joins the
    /// worker context.
    pub fn shutdown(self) {
        info!("shutting down session core");
        self.scanner.stop_scan();
        self.session.disconnect();

        let leftover = self.session.paired_addresses();
        if !leftover.is_empty() {
            let radio = self.radio.clone();
            let timeout = self.settings.connect_timeout();
            let handle = self.bridge.submit(move |_stop| async move {
                for address in leftover {
                    match tokio::time::timeout(timeout, radio.connect(&address)).await {
                        Ok(Ok(peer)) => {
                            if let Err(err) = peer.unpair().await {
                                debug!(%address, %err, "could not remove session bond");
                            } else {
                                info!(%address, "session bond removed");
                            }
                            let _ = peer.disconnect().await;
                        }
                        Ok(Err(err)) => {
                            debug!(%address, %err, "could not reach device to unpair")
                        }
                        Err(_elapsed) => {
                            debug!(%address, "timed out reaching device to unpair")
                        }
                    }
                }
                Ok(())
            });
            handle.join();
        }

        self.bridge.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod harness {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use crate::domain::events::testing::CollectingSink;
    use crate::domain::events::CoreEvent;
    use crate::domain::models::{CharProps, ConnectionState};
    use crate::domain::settings::Settings;
    use crate::infrastructure::bluetooth::mock::{MockPeer, MockRadio};

    use super::BleSessionService;

    pub(crate) const SERVICE_UUID: Uuid = Uuid::from_u128(0x1800);
    pub(crate) const CHAR_UUID: Uuid = Uuid::from_u128(0x2a00);

    /// Ceiling for event waits; individual assertions usually resolve
    /// in a few milliseconds.
    pub(crate) fn wait() -> Duration {
        Duration::from_secs(1)
    }

    fn fast_settings() -> Settings {
        Settings {
            scan_round_timeout_seconds: 0.02,
            scan_round_interval_seconds: 0.02,
            connect_timeout_seconds: 0.25,
            poll_interval_ms: 20,
            ..Default::default()
        }
    }

    pub(crate) fn harness() -> (BleSessionService, Arc<MockRadio>, Arc<CollectingSink>) {
        let radio = MockRadio::new();
        let sink = CollectingSink::new();
        let core = BleSessionService::new(radio.clone(), sink.clone(), fast_settings()).unwrap();
        (core, radio, sink)
    }

    /// Harness pre-connected to a device exposing one characteristic
    /// with the given properties.
    pub(crate) fn connected_harness(
        properties: CharProps,
    ) -> (BleSessionService, Arc<MockPeer>, Arc<CollectingSink>) {
        let (core, radio, sink) = harness();
        let peer = radio.add_peer("dev-1");
        peer.with_characteristic(SERVICE_UUID, CHAR_UUID, properties);

        core.connect("dev-1").unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::ServicesDiscovered(_)))
        }));
        assert_eq!(core.snapshot().state, ConnectionState::Connected);
        (core, peer, sink)
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::events::CoreEvent;
    use crate::domain::models::{CharProps, ConnectionState};

    use super::harness::{connected_harness, harness, wait, CHAR_UUID};

    #[test]
    fn connect_stops_an_active_scan_first() {
        let (core, radio, sink) = harness();
        radio.advertise("dev-1", Some("Sensor01"), Some(-60));

        core.start_scan().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::DeviceDiscovered(_)))
        }));

        core.connect("dev-1").unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events.iter().any(|e| matches!(e, CoreEvent::ScanStopped))
        }));
        assert!(sink.wait_until(wait(), |events| {
            events.iter().any(|e| {
                matches!(
                    e,
                    CoreEvent::ConnectionStateChanged(s) if s.state == ConnectionState::Connected
                )
            })
        }));
    }

    #[test]
    fn repeated_service_discovery_serves_the_cache() {
        let (core, peer, sink) = connected_harness(CharProps {
            read: true,
            ..Default::default()
        });

        core.discover_services().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .filter(|e| matches!(e, CoreEvent::ServicesDiscovered(_)))
                .count()
                >= 2
        }));
        // Connect queried once; the explicit call hit the cache.
        assert_eq!(peer.service_query_count(), 1);
    }

    #[test]
    fn shutdown_removes_session_bonds() {
        let (core, peer, sink) = connected_harness(CharProps {
            read: true,
            ..Default::default()
        });

        core.pair().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::PairedChanged(true)))
        }));
        assert!(peer.is_paired());

        core.shutdown();
        assert!(!peer.is_paired());
        assert_eq!(peer.unpair_count(), 1);
    }

    #[test]
    fn explicit_unpair_clears_the_session_flag() {
        let (core, peer, sink) = connected_harness(CharProps {
            read: true,
            ..Default::default()
        });

        core.pair().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::PairedChanged(true)))
        }));

        core.unpair().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::PairedChanged(false)))
        }));
        assert!(!core.snapshot().paired);
        assert!(!peer.is_paired());

        // Nothing left to clean up at shutdown.
        core.shutdown();
        assert_eq!(peer.unpair_count(), 1);
    }

    #[test]
    fn full_lifecycle_smoke() {
        let (core, radio, sink) = harness();
        let peer = radio.advertise("dev-1", Some("Sensor01"), Some(-60));
        peer.with_characteristic(
            super::harness::SERVICE_UUID,
            CHAR_UUID,
            CharProps {
                read: true,
                write: true,
                ..Default::default()
            },
        );

        core.start_scan().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::DeviceDiscovered(d) if d.name.as_deref() == Some("Sensor01")))
        }));

        core.connect("dev-1").unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::ServicesDiscovered(_)))
        }));

        core.write(CHAR_UUID, b"hello").unwrap();
        core.read(CHAR_UUID).unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::DataReceived { payload, .. } if payload == b"hello"))
        }));

        core.subscribe(CHAR_UUID).unwrap();
        core.unsubscribe(CHAR_UUID);
        core.disconnect();
        assert_eq!(core.snapshot().state, ConnectionState::Disconnected);
        core.shutdown();
    }
}
