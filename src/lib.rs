//! BLE session core: scan for peripherals, hold one connection at a
//! time, enumerate its GATT tree and talk to its characteristics, with
//! notification delivery that transparently substitutes polling when
//! the peripheral or stack cannot push.
//!
//! The caller stays synchronous: commands go into [`BleSessionService`],
//! results come back through an [`EventSink`] fed from a dedicated
//! worker context.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::events::{ChannelSink, CoreEvent, EventSink};
pub use domain::models::{
    CharProps, CharacteristicDescriptor, ConnectionState, DeliveryMode, DeviceAddress,
    DiscoveredDevice, NotificationSubscription, ServiceDescriptor, SessionSnapshot, WriteMode,
};
pub use domain::settings::{LogSettings, Settings, SettingsService};
pub use error::{
    BridgeError, CharacteristicError, ConnectionError, CoreError, PairingError, ScanError,
};
pub use infrastructure::bluetooth::backend::SystemRadio;
pub use infrastructure::bluetooth::mock::{MockPeer, MockRadio};
pub use infrastructure::bluetooth::radio::{
    AdvertisementData, NotificationStream, RadioLink, RadioPeer,
};
pub use infrastructure::bluetooth::BleSessionService;
pub use infrastructure::bridge::{AsyncBridge, StopToken, TaskHandle};
pub use infrastructure::logging::{init_logger, LoggingGuard};
