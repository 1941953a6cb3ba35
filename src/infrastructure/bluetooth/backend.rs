//! System Radio Backend
//!
//! btleplug-backed implementation of the radio seam. One adapter is
//! claimed at initialization; peripherals are addressed by the platform
//! peripheral id captured during scanning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::models::{
    CharProps, CharacteristicDescriptor, DeviceAddress, ServiceDescriptor, WriteMode,
};
use crate::error::{CharacteristicError, ConnectionError, CoreError, PairingError, ScanError};
use crate::infrastructure::bluetooth::radio::{
    AdvertisementData, NotificationStream, RadioLink, RadioPeer,
};

/// Radio seam over the first system Bluetooth adapter.
pub struct SystemRadio {
    adapter: Adapter,
}

impl SystemRadio {
    pub async fn initialize() -> Result<Self, CoreError> {
        let manager = Manager::new().await.map_err(scan_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(scan_error)?
            .into_iter()
            .next()
            .ok_or(ScanError::RadioUnavailable)?;
        info!(
            adapter = ?adapter.adapter_info().await.ok(),
            "claimed system bluetooth adapter"
        );
        Ok(Self { adapter })
    }

    async fn find(&self, address: &DeviceAddress) -> Result<Peripheral, CoreError> {
        let peripherals = self.adapter.peripherals().await.map_err(link_error)?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == address.as_str())
            .ok_or_else(|| {
                ConnectionError::Refused(format!("{address} was not seen in a recent scan")).into()
            })
    }
}

#[async_trait]
impl RadioLink for SystemRadio {
    async fn scan_round(&self, window: Duration) -> Result<Vec<AdvertisementData>, CoreError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(scan_error)?;
        tokio::time::sleep(window).await;

        let peripherals = self.adapter.peripherals().await.map_err(scan_error);
        if let Err(err) = self.adapter.stop_scan().await {
            debug!(%err, "failed to stop adapter scan cleanly");
        }

        let mut sighted = Vec::new();
        for peripheral in peripherals? {
            let Some(properties) = peripheral.properties().await.map_err(scan_error)? else {
                continue;
            };
            sighted.push(AdvertisementData {
                address: DeviceAddress::new(peripheral.id().to_string()),
                name: properties.local_name,
                rssi: properties.rssi,
            });
        }
        Ok(sighted)
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<Arc<dyn RadioPeer>, CoreError> {
        let peripheral = self.find(address).await?;
        if !peripheral.is_connected().await.map_err(link_error)? {
            peripheral
                .connect()
                .await
                .map_err(|err| ConnectionError::Refused(err.to_string()))?;
        }
        info!(%address, "link established");
        Ok(Arc::new(SystemPeer { peripheral }))
    }
}

struct SystemPeer {
    peripheral: Peripheral,
}

impl SystemPeer {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, CoreError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| CharacteristicError::Unknown(uuid).into())
    }
}

#[async_trait]
impl RadioPeer for SystemPeer {
    async fn discover_services(&self) -> Result<Vec<ServiceDescriptor>, CoreError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(link_error)?;

        let mut services = Vec::new();
        for service in self.peripheral.services() {
            let characteristics = service
                .characteristics
                .iter()
                .map(|c| CharacteristicDescriptor {
                    uuid: c.uuid,
                    service_uuid: service.uuid,
                    properties: props_from_flags(c.properties),
                })
                .collect();
            services.push(ServiceDescriptor {
                uuid: service.uuid,
                characteristics,
            });
        }
        Ok(services)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, CoreError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral.read(&target).await.map_err(link_error)
    }

    async fn write(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), CoreError> {
        let target = self.characteristic(characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&target, payload, write_type)
            .await
            .map_err(link_error)
    }

    async fn start_notifications(
        &self,
        characteristic: Uuid,
    ) -> Result<NotificationStream, CoreError> {
        let target = self.characteristic(characteristic)?;
        let notifications = self.peripheral.notifications().await.map_err(link_error)?;
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|_| CharacteristicError::NotifyUnsupported(characteristic))?;

        // The stack delivers one stream for the whole peripheral; narrow
        // it to the requested characteristic.
        Ok(Box::pin(notifications.filter_map(move |n| {
            futures::future::ready((n.uuid == characteristic).then_some(n.value))
        })))
    }

    async fn stop_notifications(&self, characteristic: Uuid) -> Result<(), CoreError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .unsubscribe(&target)
            .await
            .map_err(link_error)
    }

    async fn pair(&self) -> Result<(), CoreError> {
        // btleplug leaves bonding to the platform stack, which pairs on
        // demand when a protected attribute is touched.
        Err(PairingError::Unsupported.into())
    }

    async fn unpair(&self) -> Result<(), CoreError> {
        Err(PairingError::Unsupported.into())
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        if self.peripheral.is_connected().await.map_err(link_error)? {
            self.peripheral.disconnect().await.map_err(link_error)?;
        }
        Ok(())
    }
}

fn props_from_flags(flags: CharPropFlags) -> CharProps {
    CharProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn scan_error(err: btleplug::Error) -> CoreError {
    match err {
        btleplug::Error::PermissionDenied => ScanError::PermissionDenied.into(),
        btleplug::Error::NotSupported(_) => ScanError::RadioUnavailable.into(),
        other => ScanError::Failed(other.to_string()).into(),
    }
}

fn link_error(err: btleplug::Error) -> CoreError {
    match err {
        btleplug::Error::DeviceNotFound => {
            ConnectionError::Refused("device not found".to_string()).into()
        }
        btleplug::Error::NotConnected => ConnectionError::Lost("link closed".to_string()).into(),
        btleplug::Error::TimedOut(_) => ConnectionError::Timeout.into(),
        btleplug::Error::PermissionDenied => ScanError::PermissionDenied.into(),
        other => ConnectionError::Lost(other.to_string()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn props_from_flags_maps_every_bit() {
        let props = props_from_flags(
            CharPropFlags::READ | CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::INDICATE,
        );
        assert!(props.read);
        assert!(!props.write);
        assert!(props.write_without_response);
        assert!(!props.notify);
        assert!(props.indicate);
        assert!(props.writable());
        assert!(props.notifiable());
    }
}
