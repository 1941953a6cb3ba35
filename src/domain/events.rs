//! Event contract between the session core and its caller.
//!
//! The core never touches the caller's thread; everything it has to say
//! goes through an [`EventSink`]. A GUI typically hands the core a
//! [`ChannelSink`] and drains [`CoreEvent`]s with `try_recv` in its
//! frame loop.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::models::{DiscoveredDevice, ServiceDescriptor, SessionSnapshot};
use crate::error::CoreError;

/// Callback contract implemented by the caller. All methods are invoked
/// either from the worker context or from the thread that issued a
/// synchronous command; implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    fn on_device_discovered(&self, device: &DiscoveredDevice);
    fn on_scan_stopped(&self);
    fn on_connection_state_changed(&self, snapshot: &SessionSnapshot);
    fn on_services_discovered(&self, services: &[ServiceDescriptor]);
    fn on_data_received(&self, characteristic: Uuid, payload: &[u8]);
    fn on_paired_changed(&self, paired: bool);
    fn on_error(&self, error: &CoreError);
}

/// Owned mirror of the sink methods, for callers that prefer draining a
/// channel over implementing the trait.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    DeviceDiscovered(DiscoveredDevice),
    ScanStopped,
    ConnectionStateChanged(SessionSnapshot),
    ServicesDiscovered(Vec<ServiceDescriptor>),
    DataReceived {
        characteristic: Uuid,
        payload: Vec<u8>,
    },
    PairedChanged(bool),
    Error {
        kind: &'static str,
        message: String,
    },
}

/// Sink that forwards every callback as a [`CoreEvent`] over an
/// unbounded channel. Send failures mean the receiver is gone and are
/// ignored, the same way a closed UI ignores late updates.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_device_discovered(&self, device: &DiscoveredDevice) {
        self.send(CoreEvent::DeviceDiscovered(device.clone()));
    }

    fn on_scan_stopped(&self) {
        self.send(CoreEvent::ScanStopped);
    }

    fn on_connection_state_changed(&self, snapshot: &SessionSnapshot) {
        self.send(CoreEvent::ConnectionStateChanged(snapshot.clone()));
    }

    fn on_services_discovered(&self, services: &[ServiceDescriptor]) {
        self.send(CoreEvent::ServicesDiscovered(services.to_vec()));
    }

    fn on_data_received(&self, characteristic: Uuid, payload: &[u8]) {
        self.send(CoreEvent::DataReceived {
            characteristic,
            payload: payload.to_vec(),
        });
    }

    fn on_paired_changed(&self, paired: bool) {
        self.send(CoreEvent::PairedChanged(paired));
    }

    fn on_error(&self, error: &CoreError) {
        self.send(CoreEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ConnectionState, DeviceAddress};
    use std::time::SystemTime;

    #[test]
    fn channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new();

        sink.on_device_discovered(&DiscoveredDevice {
            address: DeviceAddress::from("11:22"),
            name: Some("Sensor01".to_string()),
            rssi: -60,
            last_seen: SystemTime::now(),
        });
        sink.on_connection_state_changed(&SessionSnapshot {
            address: None,
            state: ConnectionState::Disconnected,
            paired: false,
        });

        assert!(matches!(
            rx.try_recv().unwrap(),
            CoreEvent::DeviceDiscovered(d) if d.rssi == -60
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            CoreEvent::ConnectionStateChanged(s) if s.state == ConnectionState::Disconnected
        ));
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_scan_stopped();
        sink.on_paired_changed(true);
    }
}
