//! Scriptable in-memory radio, the test double for the radio seam.
//! Devices, GATT trees, link failures and notification pushes are all
//! configured up front so session behavior can be asserted without an
//! antenna.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::domain::models::{
    CharProps, CharacteristicDescriptor, DeviceAddress, ServiceDescriptor, WriteMode,
};
use crate::error::{CharacteristicError, ConnectionError, CoreError, PairingError, ScanError};
use crate::infrastructure::bluetooth::radio::{
    AdvertisementData, NotificationStream, RadioLink, RadioPeer,
};

#[derive(Default)]
pub struct MockRadio {
    advertisements: Mutex<Vec<AdvertisementData>>,
    peers: Mutex<HashMap<DeviceAddress, Arc<MockPeer>>>,
    scan_failure: Mutex<Option<ScanError>>,
}

impl MockRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a peripheral and makes it show up in every discovery
    /// round with the given advertisement.
    pub fn advertise(
        &self,
        address: impl Into<DeviceAddress>,
        name: Option<&str>,
        rssi: Option<i16>,
    ) -> Arc<MockPeer> {
        let address = address.into();
        self.advertisements.lock().unwrap().push(AdvertisementData {
            address: address.clone(),
            name: name.map(str::to_string),
            rssi,
        });
        self.add_peer(address)
    }

    /// Registers a connectable peripheral that does not advertise.
    pub fn add_peer(&self, address: impl Into<DeviceAddress>) -> Arc<MockPeer> {
        let address = address.into();
        let peer = Arc::new(MockPeer::new(address.clone()));
        self.peers.lock().unwrap().insert(address, peer.clone());
        peer
    }

    /// Replaces the advertisement reported for an already registered
    /// peripheral, simulating a changed sighting.
    pub fn update_advertisement(
        &self,
        address: impl Into<DeviceAddress>,
        name: Option<&str>,
        rssi: Option<i16>,
    ) {
        let address = address.into();
        let mut ads = self.advertisements.lock().unwrap();
        ads.retain(|ad| ad.address != address);
        ads.push(AdvertisementData {
            address,
            name: name.map(str::to_string),
            rssi,
        });
    }

    pub fn fail_scans_with(&self, error: ScanError) {
        *self.scan_failure.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl RadioLink for MockRadio {
    async fn scan_round(&self, window: Duration) -> Result<Vec<AdvertisementData>, CoreError> {
        if let Some(error) = self.scan_failure.lock().unwrap().take() {
            return Err(error.into());
        }
        tokio::time::sleep(window).await;
        Ok(self.advertisements.lock().unwrap().clone())
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<Arc<dyn RadioPeer>, CoreError> {
        let peer = self
            .peers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| ConnectionError::Refused(format!("{address} is unknown")))?;

        if !peer.reachable.load(Ordering::Acquire) {
            // Unreachable peripherals never answer; the session's
            // connect timeout is what ends the attempt.
            std::future::pending::<()>().await;
        }
        if peer.refuse_connect.load(Ordering::Acquire) {
            return Err(ConnectionError::Refused("connection rejected".to_string()).into());
        }

        peer.link_up.store(true, Ordering::Release);
        Ok(peer as Arc<dyn RadioPeer>)
    }
}

pub struct MockPeer {
    address: DeviceAddress,
    services: Mutex<Vec<ServiceDescriptor>>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    notify_channels: Mutex<HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>>,
    last_write_mode: Mutex<Option<WriteMode>>,
    reachable: AtomicBool,
    refuse_connect: AtomicBool,
    link_up: AtomicBool,
    pairing_supported: AtomicBool,
    paired: AtomicBool,
    native_notify_enabled: AtomicBool,
    unpair_count: Mutex<u32>,
    service_queries: Mutex<u32>,
}

impl MockPeer {
    fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            services: Mutex::new(Vec::new()),
            values: Mutex::new(HashMap::new()),
            notify_channels: Mutex::new(HashMap::new()),
            last_write_mode: Mutex::new(None),
            reachable: AtomicBool::new(true),
            refuse_connect: AtomicBool::new(false),
            link_up: AtomicBool::new(false),
            pairing_supported: AtomicBool::new(true),
            paired: AtomicBool::new(false),
            native_notify_enabled: AtomicBool::new(true),
            unpair_count: Mutex::new(0),
            service_queries: Mutex::new(0),
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Adds a characteristic, creating its service entry on first use.
    pub fn with_characteristic(&self, service_uuid: Uuid, uuid: Uuid, properties: CharProps) {
        let mut services = self.services.lock().unwrap();
        let descriptor = CharacteristicDescriptor {
            uuid,
            service_uuid,
            properties,
        };
        if let Some(service) = services.iter_mut().find(|s| s.uuid == service_uuid) {
            service.characteristics.push(descriptor);
        } else {
            services.push(ServiceDescriptor {
                uuid: service_uuid,
                characteristics: vec![descriptor],
            });
        }
    }

    pub fn set_value(&self, characteristic: Uuid, payload: &[u8]) {
        self.values
            .lock()
            .unwrap()
            .insert(characteristic, payload.to_vec());
    }

    /// Pushes a native notification to an active subscription; dropped
    /// silently when nothing is subscribed, like a real stack.
    pub fn push_notification(&self, characteristic: Uuid, payload: &[u8]) {
        if let Some(tx) = self.notify_channels.lock().unwrap().get(&characteristic) {
            let _ = tx.send(payload.to_vec());
        }
    }

    pub fn set_unreachable(&self) {
        self.reachable.store(false, Ordering::Release);
    }

    pub fn set_refuse_connect(&self) {
        self.refuse_connect.store(true, Ordering::Release);
    }

    pub fn set_pairing_supported(&self, supported: bool) {
        self.pairing_supported.store(supported, Ordering::Release);
    }

    /// Makes native subscription attempts fail, forcing the polling
    /// fallback even on notify-capable characteristics.
    pub fn set_native_notify_enabled(&self, enabled: bool) {
        self.native_notify_enabled.store(enabled, Ordering::Release);
    }

    /// Severs the link: every subsequent operation fails as lost.
    pub fn drop_link(&self) {
        self.link_up.store(false, Ordering::Release);
        self.notify_channels.lock().unwrap().clear();
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    pub fn is_paired(&self) -> bool {
        self.paired.load(Ordering::Acquire)
    }

    pub fn unpair_count(&self) -> u32 {
        *self.unpair_count.lock().unwrap()
    }

    /// How many times the GATT tree was actually queried.
    pub fn service_query_count(&self) -> u32 {
        *self.service_queries.lock().unwrap()
    }

    pub fn last_write_mode(&self) -> Option<WriteMode> {
        *self.last_write_mode.lock().unwrap()
    }

    fn ensure_link(&self) -> Result<(), CoreError> {
        if self.link_up.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ConnectionError::Lost("mock link severed".to_string()).into())
        }
    }
}

#[async_trait]
impl RadioPeer for MockPeer {
    async fn discover_services(&self) -> Result<Vec<ServiceDescriptor>, CoreError> {
        self.ensure_link()?;
        *self.service_queries.lock().unwrap() += 1;
        Ok(self.services.lock().unwrap().clone())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, CoreError> {
        self.ensure_link()?;
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(&characteristic)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), CoreError> {
        self.ensure_link()?;
        self.values
            .lock()
            .unwrap()
            .insert(characteristic, payload.to_vec());
        *self.last_write_mode.lock().unwrap() = Some(mode);
        Ok(())
    }

    async fn start_notifications(
        &self,
        characteristic: Uuid,
    ) -> Result<NotificationStream, CoreError> {
        self.ensure_link()?;
        if !self.native_notify_enabled.load(Ordering::Acquire) {
            return Err(CharacteristicError::NotifyUnsupported(characteristic).into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.notify_channels
            .lock()
            .unwrap()
            .insert(characteristic, tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn stop_notifications(&self, characteristic: Uuid) -> Result<(), CoreError> {
        self.notify_channels.lock().unwrap().remove(&characteristic);
        Ok(())
    }

    async fn pair(&self) -> Result<(), CoreError> {
        self.ensure_link()?;
        if !self.pairing_supported.load(Ordering::Acquire) {
            return Err(PairingError::Rejected("bonding not supported".to_string()).into());
        }
        self.paired.store(true, Ordering::Release);
        Ok(())
    }

    async fn unpair(&self) -> Result<(), CoreError> {
        self.ensure_link()?;
        self.paired.store(false, Ordering::Release);
        *self.unpair_count.lock().unwrap() += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        self.link_up.store(false, Ordering::Release);
        self.notify_channels.lock().unwrap().clear();
        Ok(())
    }
}
