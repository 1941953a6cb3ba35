//! Radio Seam
//!
//! The narrow boundary between the session core and whatever actually
//! owns the antenna. Production uses the [`backend`] implementation over
//! btleplug; tests drive the deterministic [`mock`].
//!
//! [`backend`]: crate::infrastructure::bluetooth::backend
//! [`mock`]: crate::infrastructure::bluetooth::mock

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::domain::models::{DeviceAddress, ServiceDescriptor, WriteMode};
use crate::error::CoreError;

/// One sighting from a discovery round. The registry applies the
/// default RSSI when the stack reported none.
#[derive(Debug, Clone)]
pub struct AdvertisementData {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Per-characteristic stream of notification payloads. Ends when the
/// subscription is torn down or the link drops.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Access to the local radio: discovery and connection establishment.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Runs one discovery window and returns everything sighted in it.
    async fn scan_round(&self, window: Duration) -> Result<Vec<AdvertisementData>, CoreError>;

    /// Establishes a link to a previously sighted peripheral. Callers
    /// bound this with their own timeout.
    async fn connect(&self, address: &DeviceAddress) -> Result<Arc<dyn RadioPeer>, CoreError>;
}

/// An established link to one peripheral. Handles returned by
/// [`RadioLink::connect`] are only valid until `disconnect`.
#[async_trait]
pub trait RadioPeer: Send + Sync {
    async fn discover_services(&self) -> Result<Vec<ServiceDescriptor>, CoreError>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, CoreError>;

    async fn write(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), CoreError>;

    /// Registers for native notifications/indications and returns the
    /// payload stream. Failure here is the fallback trigger, not a
    /// surfaced error.
    async fn start_notifications(
        &self,
        characteristic: Uuid,
    ) -> Result<NotificationStream, CoreError>;

    async fn stop_notifications(&self, characteristic: Uuid) -> Result<(), CoreError>;

    async fn pair(&self) -> Result<(), CoreError>;

    async fn unpair(&self) -> Result<(), CoreError>;

    async fn disconnect(&self) -> Result<(), CoreError>;
}
