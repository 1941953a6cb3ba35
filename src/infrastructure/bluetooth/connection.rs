//! Connection Session
//!
//! Owns the lifecycle of the single active connection: the state
//! machine, the cached service catalog, the session pairing flag and
//! every active subscription. Exactly one session can be anything other
//! than `Disconnected` at a time; that invariant is enforced here, not
//! by callers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::events::EventSink;
use crate::domain::models::{
    ConnectionState, DeliveryMode, DeviceAddress, ServiceDescriptor, SessionSnapshot,
};
use crate::error::{ConnectionError, CoreError};
use crate::infrastructure::bluetooth::radio::{RadioLink, RadioPeer};
use crate::infrastructure::bridge::{AsyncBridge, TaskHandle};

/// Session state shared between the caller's thread and worker tasks.
/// The lock is never held across an await point.
pub(crate) struct SessionShared {
    pub(crate) state: Mutex<SessionState>,
}

pub(crate) struct SessionState {
    pub(crate) address: Option<DeviceAddress>,
    pub(crate) state: ConnectionState,
    pub(crate) paired: bool,
    pub(crate) peer: Option<Arc<dyn RadioPeer>>,
    pub(crate) catalog: Option<Vec<ServiceDescriptor>>,
}

impl SessionState {
    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            address: self.address.clone(),
            state: self.state,
            paired: self.paired,
        }
    }
}

impl SessionShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState {
                address: None,
                state: ConnectionState::Disconnected,
                paired: false,
                peer: None,
                catalog: None,
            }),
        })
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().state
    }
}

/// Delivery bookkeeping for one subscribed characteristic.
pub(crate) struct SubscriptionInfo {
    pub(crate) characteristic: Uuid,
    pub(crate) poll_interval: Duration,
    pub(crate) mode: Mutex<DeliveryMode>,
}

pub(crate) struct ActiveSubscription {
    pub(crate) info: Arc<SubscriptionInfo>,
    pub(crate) handle: TaskHandle,
}

pub(crate) type SubscriptionMap = Mutex<HashMap<Uuid, ActiveSubscription>>;

pub struct ConnectionSession {
    shared: Arc<SessionShared>,
    subscriptions: Arc<SubscriptionMap>,
    paired_addresses: Mutex<HashSet<DeviceAddress>>,
    radio: Arc<dyn RadioLink>,
    bridge: Arc<AsyncBridge>,
    gate: Arc<tokio::sync::Mutex<()>>,
    sink: Arc<dyn EventSink>,
    connect_timeout: Duration,
}

impl ConnectionSession {
    pub(crate) fn new(
        radio: Arc<dyn RadioLink>,
        bridge: Arc<AsyncBridge>,
        gate: Arc<tokio::sync::Mutex<()>>,
        sink: Arc<dyn EventSink>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            shared: SessionShared::new(),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            paired_addresses: Mutex::new(HashSet::new()),
            radio,
            bridge,
            gate,
            sink,
            connect_timeout,
        }
    }

    pub(crate) fn shared(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }

    pub(crate) fn subscriptions(&self) -> Arc<SubscriptionMap> {
        self.subscriptions.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.state.lock().unwrap().snapshot()
    }

    /// Addresses paired at some point during this process and not yet
    /// explicitly unpaired.
    pub fn paired_addresses(&self) -> Vec<DeviceAddress> {
        self.paired_addresses.lock().unwrap().iter().cloned().collect()
    }

    /// Claims the session for a connection attempt. Fails busy unless
    /// the session is fully disconnected; on success the state is
    /// `Connecting` and the transition has been reported.
    pub(crate) fn begin_connect(&self, address: DeviceAddress) -> Result<(), CoreError> {
        let snapshot = {
            let mut st = self.shared.state.lock().unwrap();
            if st.state != ConnectionState::Disconnected {
                return Err(ConnectionError::Busy.into());
            }
            st.state = ConnectionState::Connecting;
            st.address = Some(address);
            st.snapshot()
        };
        self.sink.on_connection_state_changed(&snapshot);
        Ok(())
    }

    /// Runs the radio connection attempt claimed by [`begin_connect`].
    ///
    /// [`begin_connect`]: Self::begin_connect
    pub(crate) fn spawn_connect(self: &Arc<Self>, address: DeviceAddress) {
        let session = self.clone();
        let _handle = self.bridge.submit(move |_stop| async move {
            session.run_connect(address).await
        });
    }

    async fn run_connect(self: Arc<Self>, address: DeviceAddress) -> Result<(), CoreError> {
        info!(%address, "connecting");
        let attempt = {
            let _gate = self.gate.lock().await;
            tokio::time::timeout(self.connect_timeout, self.radio.connect(&address)).await
        };

        let peer = match attempt {
            Ok(Ok(peer)) => peer,
            Ok(Err(err)) => {
                self.revert_failed_connect();
                return Err(err);
            }
            Err(_elapsed) => {
                self.revert_failed_connect();
                return Err(ConnectionError::Timeout.into());
            }
        };

        // disconnect() may have superseded the attempt while the radio
        // was still answering; if so, give the link straight back.
        let installed = {
            let mut st = self.shared.state.lock().unwrap();
            if st.state == ConnectionState::Connecting && st.address.as_ref() == Some(&address) {
                st.state = ConnectionState::Connected;
                st.peer = Some(peer.clone());
                Some(st.snapshot())
            } else {
                None
            }
        };
        let Some(snapshot) = installed else {
            info!(%address, "connection attempt superseded, releasing link");
            let _gate = self.gate.lock().await;
            let _ = peer.disconnect().await;
            return Ok(());
        };
        self.sink.on_connection_state_changed(&snapshot);
        info!(%address, "connected");

        // Enumerate services right away so the catalog is ready for the
        // first read/write. A failure here leaves the connection up.
        let tree = {
            let _gate = self.gate.lock().await;
            peer.discover_services().await
        };
        match tree {
            Ok(services) => {
                self.shared.state.lock().unwrap().catalog = Some(services.clone());
                self.sink.on_services_discovered(&services);
            }
            Err(err) => {
                warn!(%err, "service discovery after connect failed");
                if err.is_transport_loss() {
                    self.mark_lost();
                }
                self.sink.on_error(&err);
            }
        }
        Ok(())
    }

    fn revert_failed_connect(&self) {
        let snapshot = {
            let mut st = self.shared.state.lock().unwrap();
            if st.state != ConnectionState::Connecting {
                return;
            }
            st.state = ConnectionState::Disconnected;
            st.address = None;
            st.peer = None;
            st.snapshot()
        };
        self.sink.on_connection_state_changed(&snapshot);
    }

    /// Full teardown, callable from any state. Blocks until every
    /// subscription task has exited and the final state change has been
    /// reported, so nothing issued afterwards can race with it.
    pub fn disconnect(&self) {
        self.spawn_teardown().join();
    }

    fn spawn_teardown(&self) -> TaskHandle {
        let shared = self.shared.clone();
        let subscriptions = self.subscriptions.clone();
        let gate = self.gate.clone();
        let sink = self.sink.clone();
        self.bridge
            .submit(move |_stop| async move { teardown(shared, subscriptions, gate, sink).await })
    }

    /// Reacts to a transport loss reported by some operation: the
    /// session is torn down through the normal path. The error itself is
    /// reported by the operation that hit it.
    pub(crate) fn mark_lost(&self) {
        {
            let st = self.shared.state.lock().unwrap();
            if matches!(
                st.state,
                ConnectionState::Disconnecting | ConnectionState::Disconnected
            ) {
                return;
            }
        }
        warn!("transport lost, tearing down session");
        let _handle = self.spawn_teardown();
    }

    pub(crate) fn pair(self: &Arc<Self>) -> Result<(), CoreError> {
        let (peer, address) = self.connected_peer()?;
        let session = self.clone();
        let _handle = self.bridge.submit(move |_stop| async move {
            let outcome = {
                let _gate = session.gate.lock().await;
                peer.pair().await
            };
            match outcome {
                Ok(()) => {
                    session.shared.state.lock().unwrap().paired = true;
                    if let Some(address) = address {
                        session.paired_addresses.lock().unwrap().insert(address);
                    }
                    session.sink.on_paired_changed(true);
                    Ok(())
                }
                Err(err) => {
                    if err.is_transport_loss() {
                        session.mark_lost();
                    }
                    Err(err)
                }
            }
        });
        Ok(())
    }

    pub(crate) fn unpair(self: &Arc<Self>) -> Result<(), CoreError> {
        let (peer, address) = self.connected_peer()?;
        let session = self.clone();
        let _handle = self.bridge.submit(move |_stop| async move {
            let outcome = {
                let _gate = session.gate.lock().await;
                peer.unpair().await
            };
            match outcome {
                Ok(()) => {
                    session.shared.state.lock().unwrap().paired = false;
                    if let Some(address) = address {
                        session.paired_addresses.lock().unwrap().remove(&address);
                    }
                    session.sink.on_paired_changed(false);
                    Ok(())
                }
                Err(err) => {
                    if err.is_transport_loss() {
                        session.mark_lost();
                    }
                    Err(err)
                }
            }
        });
        Ok(())
    }

    /// Reports the GATT tree for the active session, querying the radio
    /// only on the first call per connection.
    pub(crate) fn discover_services(self: &Arc<Self>) -> Result<(), CoreError> {
        let (peer, _address) = self.connected_peer()?;
        let session = self.clone();
        let _handle = self.bridge.submit(move |_stop| async move {
            let cached = session.shared.state.lock().unwrap().catalog.clone();
            if let Some(services) = cached {
                debug!("serving catalog from cache");
                session.sink.on_services_discovered(&services);
                return Ok(());
            }

            let tree = {
                let _gate = session.gate.lock().await;
                peer.discover_services().await
            };
            match tree {
                Ok(services) => {
                    session.shared.state.lock().unwrap().catalog = Some(services.clone());
                    session.sink.on_services_discovered(&services);
                    Ok(())
                }
                Err(err) => {
                    if err.is_transport_loss() {
                        session.mark_lost();
                    }
                    Err(err)
                }
            }
        });
        Ok(())
    }

    fn connected_peer(
        &self,
    ) -> Result<(Arc<dyn RadioPeer>, Option<DeviceAddress>), CoreError> {
        let st = self.shared.state.lock().unwrap();
        if st.state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected.into());
        }
        let peer = st.peer.clone().ok_or(ConnectionError::NotConnected)?;
        Ok((peer, st.address.clone()))
    }
}

/// The one teardown sequence, used by disconnect, transport loss and
/// shutdown alike. Ordering matters: delivery stops before the catalog
/// and pairing flag are dropped, and the radio handle is released before
/// the final state change goes out.
async fn teardown(
    shared: Arc<SessionShared>,
    subscriptions: Arc<SubscriptionMap>,
    gate: Arc<tokio::sync::Mutex<()>>,
    sink: Arc<dyn EventSink>,
) -> Result<(), CoreError> {
    let drained: Vec<ActiveSubscription> = {
        let mut map = subscriptions.lock().unwrap();
        map.drain().map(|(_, sub)| sub).collect()
    };
    for subscription in drained {
        subscription.handle.cancel_async().await;
    }

    let peer = {
        let mut st = shared.state.lock().unwrap();
        st.state = ConnectionState::Disconnecting;
        st.catalog = None;
        st.paired = false;
        st.peer.take()
    };

    if let Some(peer) = peer {
        let _gate = gate.lock().await;
        if let Err(err) = peer.disconnect().await {
            debug!(%err, "radio disconnect failed during teardown");
        }
    }

    let snapshot = {
        let mut st = shared.state.lock().unwrap();
        st.state = ConnectionState::Disconnected;
        st.address = None;
        st.snapshot()
    };
    sink.on_connection_state_changed(&snapshot);
    info!("session torn down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::domain::events::CoreEvent;
    use crate::domain::models::{CharProps, ConnectionState};
    use crate::infrastructure::bluetooth::service::harness::{harness, wait, SERVICE_UUID};

    #[test]
    fn connect_transitions_to_connected_and_discovers_services() {
        let (core, radio, sink) = harness();
        let peer = radio.advertise("dev-1", Some("Sensor01"), Some(-60));
        peer.with_characteristic(
            SERVICE_UUID,
            uuid::Uuid::from_u128(0x10),
            CharProps {
                read: true,
                ..Default::default()
            },
        );

        core.connect("dev-1").unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events.iter().any(|e| matches!(e, CoreEvent::ServicesDiscovered(s) if s.len() == 1))
        }));

        let snapshot = core.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.address.as_ref(), Some(peer.address()));
        assert!(!snapshot.paired);
    }

    #[test]
    fn connect_to_unreachable_address_times_out_and_reverts() {
        let (core, radio, sink) = harness();
        let peer = radio.add_peer("00:00:00:00:00:00");
        peer.set_unreachable();

        core.connect("00:00:00:00:00:00").unwrap();
        assert!(sink.wait_until(Duration::from_secs(2), |events| {
            events.iter().any(
                |e| matches!(e, CoreEvent::Error { kind, message } if *kind == "ConnectionError" && message.contains("timed out")),
            )
        }));
        assert_eq!(core.snapshot().state, ConnectionState::Disconnected);
    }

    #[test]
    fn connect_refusal_reverts_to_disconnected() {
        let (core, radio, sink) = harness();
        let peer = radio.add_peer("dev-1");
        peer.set_refuse_connect();

        core.connect("dev-1").unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::Error { kind, .. } if *kind == "ConnectionError"))
        }));
        assert_eq!(core.snapshot().state, ConnectionState::Disconnected);
    }

    #[test]
    fn second_connect_fails_busy_while_active() {
        let (core, radio, sink) = harness();
        radio.add_peer("dev-1");
        radio.add_peer("dev-2");

        core.connect("dev-1").unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events.iter().any(|e| {
                matches!(
                    e,
                    CoreEvent::ConnectionStateChanged(s) if s.state == ConnectionState::Connected
                )
            })
        }));

        let err = core.connect("dev-2").unwrap_err();
        assert_eq!(err.kind(), "ConnectionError");
        // The original session is untouched.
        assert_eq!(
            core.snapshot().address.unwrap().as_str(),
            "dev-1"
        );
    }

    #[test]
    fn disconnect_is_idempotent_from_any_state() {
        let (core, radio, _sink) = harness();
        radio.add_peer("dev-1");

        // From Disconnected.
        core.disconnect();
        assert_eq!(core.snapshot().state, ConnectionState::Disconnected);

        // From Connected.
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
        core.disconnect();
        core.disconnect();
        assert_eq!(core.snapshot().state, ConnectionState::Disconnected);
    }

    #[test]
    fn pairing_is_session_scoped() {
        let (core, radio, sink) = harness();
        let peer = radio.add_peer("dev-1");

        core.connect("dev-1").unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events.iter().any(|e| {
                matches!(
                    e,
                    CoreEvent::ConnectionStateChanged(s) if s.state == ConnectionState::Connected
                )
            })
        }));

        core.pair().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::PairedChanged(true)))
        }));
        assert!(core.snapshot().paired);
        assert!(peer.is_paired());

        // A fresh connection to the same address starts unpaired.
        core.disconnect();
        core.connect("dev-1").unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .filter(|e| {
                    matches!(
                        e,
                        CoreEvent::ConnectionStateChanged(s)
                            if s.state == ConnectionState::Connected
                    )
                })
                .count()
                >= 2
        }));
        assert!(!core.snapshot().paired);
    }

    #[test]
    fn pairing_rejection_keeps_the_connection() {
        let (core, radio, sink) = harness();
        let peer = radio.add_peer("dev-1");
        peer.set_pairing_supported(false);

        core.connect("dev-1").unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events.iter().any(|e| {
                matches!(
                    e,
                    CoreEvent::ConnectionStateChanged(s) if s.state == ConnectionState::Connected
                )
            })
        }));

        core.pair().unwrap();
        assert!(sink.wait_until(wait(), |events| {
            events
                .iter()
                .any(|e| matches!(e, CoreEvent::Error { kind, .. } if *kind == "PairingError"))
        }));
        assert_eq!(core.snapshot().state, ConnectionState::Connected);
        assert!(!core.snapshot().paired);
    }

    #[test]
    fn pair_requires_a_connection() {
        let (core, _radio, _sink) = harness();
        let err = core.pair().unwrap_err();
        assert_eq!(err.kind(), "ConnectionError");
    }
}
