//! Scan Controller
//!
//! Drives repeating discovery rounds and maintains the device registry.
//! Each round merges its sightings into the registry; a device is
//! reported when it is new or its advertisement changed.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{debug, info};

use crate::domain::events::EventSink;
use crate::domain::models::{
    ConnectionState, DeviceAddress, DiscoveredDevice, DEFAULT_RSSI,
};
use crate::error::{CoreError, ScanError};
use crate::infrastructure::bluetooth::connection::SessionShared;
use crate::infrastructure::bluetooth::radio::{AdvertisementData, RadioLink};
use crate::infrastructure::bridge::{AsyncBridge, TaskHandle};

type Registry = Arc<Mutex<HashMap<DeviceAddress, DiscoveredDevice>>>;

pub struct ScanController {
    registry: Registry,
    task: Mutex<Option<TaskHandle>>,
    session: Arc<SessionShared>,
    radio: Arc<dyn RadioLink>,
    bridge: Arc<AsyncBridge>,
    gate: Arc<tokio::sync::Mutex<()>>,
    sink: Arc<dyn EventSink>,
    window: Duration,
    interval: Duration,
}

impl ScanController {
    pub(crate) fn new(
        session: Arc<SessionShared>,
        radio: Arc<dyn RadioLink>,
        bridge: Arc<AsyncBridge>,
        gate: Arc<tokio::sync::Mutex<()>>,
        sink: Arc<dyn EventSink>,
        window: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
            session,
            radio,
            bridge,
            gate,
            sink,
            window,
            interval,
        }
    }

    /// Starts the repeating discovery loop. A second call while a scan
    /// is active is a no-op; starting while a connection is being
    /// established or is up fails busy.
    pub fn start_scan(&self) -> Result<(), CoreError> {
        if matches!(
            self.session.connection_state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Err(ScanError::Busy.into());
        }

        let mut slot = self.task.lock().unwrap();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                debug!("scan already running");
                return Ok(());
            }
        }

        info!("starting discovery");
        self.registry.lock().unwrap().clear();

        let registry = self.registry.clone();
        let radio = self.radio.clone();
        let gate = self.gate.clone();
        let sink = self.sink.clone();
        let window = self.window;
        let interval = self.interval;

        let handle = self.bridge.submit(move |mut stop| async move {
            loop {
                if stop.is_stopped() {
                    break;
                }
                let round = {
                    let _gate = gate.lock().await;
                    radio.scan_round(window).await
                };
                let sighted = round?;
                merge_round(&registry, sighted, sink.as_ref());

                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            Ok(())
        });
        *slot = Some(handle);
        Ok(())
    }

    /// Stops the discovery loop and blocks until it has fully exited;
    /// no discovery event can fire after this returns. No-op when no
    /// scan was started.
    pub fn stop_scan(&self) {
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.cancel();
            info!("discovery stopped");
            self.sink.on_scan_stopped();
        }
    }

    /// Snapshot of the registry, most recent sightings included.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.registry.lock().unwrap().values().cloned().collect()
    }
}

fn merge_round(registry: &Registry, sighted: Vec<AdvertisementData>, sink: &dyn EventSink) {
    let now = SystemTime::now();
    let mut registry = registry.lock().unwrap();
    for ad in sighted {
        let rssi = ad.rssi.unwrap_or(DEFAULT_RSSI);
        match registry.entry(ad.address.clone()) {
            Entry::Occupied(mut occupied) => {
                let device = occupied.get_mut();
                let changed = device.rssi != rssi || device.name != ad.name;
                device.name = ad.name;
                device.rssi = rssi;
                device.last_seen = now;
                if changed {
                    sink.on_device_discovered(device);
                }
            }
            Entry::Vacant(vacant) => {
                let device = vacant.insert(DiscoveredDevice {
                    address: ad.address,
                    name: ad.name,
                    rssi,
                    last_seen: now,
                });
                debug!(address = %device.address, rssi, "device discovered");
                sink.on_device_discovered(device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::domain::events::CoreEvent;
    use crate::domain::models::ConnectionState;
    use crate::error::ScanError;
    use crate::infrastructure::bluetooth::service::harness::{harness, wait};

    #[test]
    fn discovery_round_registers_each_device_once() {
        let (core, radio, sink) = harness();
        radio.advertise("addr-a", Some("Sensor01"), Some(-60));

        core.start_scan().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::DeviceDiscovered(_)))
        }));
        // Let several rounds elapse; the registry must not grow.
        std::thread::sleep(Duration::from_millis(120));
        core.stop_scan();

        let devices = core.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address.as_str(), "addr-a");
        assert_eq!(devices[0].name.as_deref(), Some("Sensor01"));
        assert_eq!(devices[0].rssi, -60);
    }

    #[test]
    fn rediscovery_overwrites_in_place_and_reports_the_change() {
        let (core, radio, sink) = harness();
        radio.advertise("addr-a", Some("Sensor01"), Some(-60));

        core.start_scan().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::DeviceDiscovered(d) if d.rssi == -60))
        }));

        radio.update_advertisement("addr-a", Some("Sensor01"), Some(-48));
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::DeviceDiscovered(d) if d.rssi == -48))
        }));
        core.stop_scan();

        let devices = core.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].rssi, -48);
    }

    #[test]
    fn start_scan_twice_keeps_one_discovery_loop() {
        let (core, radio, sink) = harness();
        radio.advertise("addr-a", None, Some(-70));

        core.start_scan().unwrap();
        core.start_scan().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::DeviceDiscovered(_)))
        }));
        core.stop_scan();

        // One loop means one stop event; a second loop would still be
        // emitting discoveries after the registry snapshot below.
        assert_eq!(sink.count(|e| matches!(e, CoreEvent::ScanStopped)), 1);
        let after = sink.count(|e| matches!(e, CoreEvent::DeviceDiscovered(_)));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            sink.count(|e| matches!(e, CoreEvent::DeviceDiscovered(_))),
            after
        );
    }

    #[test]
    fn no_discovery_events_after_stop_scan_returns() {
        let (core, radio, sink) = harness();
        radio.advertise("addr-a", None, Some(-70));

        core.start_scan().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::DeviceDiscovered(_)))
        }));
        core.stop_scan();

        let baseline = sink.count(|e| matches!(e, CoreEvent::DeviceDiscovered(_)));
        radio.update_advertisement("addr-a", None, Some(-20));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(
            sink.count(|e| matches!(e, CoreEvent::DeviceDiscovered(_))),
            baseline
        );
    }

    #[test]
    fn scanning_is_rejected_while_a_connection_is_active() {
        let (core, radio, sink) = harness();
        radio.add_peer("dev-1");

        core.connect("dev-1").unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events.iter().any(|e| {
                matches!(
                    e,
                    CoreEvent::ConnectionStateChanged(s) if s.state == ConnectionState::Connected
                )
            })
        }));

        let err = core.start_scan().unwrap_err();
        assert_eq!(err.kind(), "ScanError");
    }

    #[test]
    fn scan_failure_is_reported_and_ends_the_loop() {
        let (core, radio, sink) = harness();
        radio.fail_scans_with(ScanError::PermissionDenied);

        core.start_scan().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::Error { kind, .. } if *kind == "ScanError"))
        }));

        // The loop is gone; a new scan can start.
        core.start_scan().unwrap();
        core.stop_scan();
    }
}
