use std::fmt;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

/// RSSI reported for a sighting that carried no signal strength.
pub const DEFAULT_RSSI: i16 = -50;

/// Platform identifier of a peripheral. Unique key of the device
/// registry; stable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for DeviceAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// One entry of the device registry. Re-discovery overwrites name, rssi
/// and last_seen in place; the registry never holds duplicates.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub last_seen: SystemTime,
}

/// Connection lifecycle of the single active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Immutable view of the session, delivered through
/// `on_connection_state_changed`.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub address: Option<DeviceAddress>,
    pub state: ConnectionState,
    pub paired: bool,
}

/// GATT property set of a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProps {
    pub fn readable(&self) -> bool {
        self.read
    }

    pub fn writable(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn notifiable(&self) -> bool {
        self.notify || self.indicate
    }
}

/// Write mode actually used on the wire. Confirmed writes are preferred
/// when the characteristic declares both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharProps,
}

#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

/// How subscription data reaches the sink: a native notify/indicate
/// registration, or the polling substitute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Native,
    Polling,
}

/// Snapshot of an active subscription. At most one exists per
/// characteristic; re-subscribing replaces it.
#[derive(Debug, Clone)]
pub struct NotificationSubscription {
    pub characteristic: Uuid,
    pub mode: DeliveryMode,
    pub poll_interval: Duration,
}
