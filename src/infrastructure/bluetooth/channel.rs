//! Communication Channel
//!
//! Reads, writes and subscriptions against the characteristics of the
//! active session. Subscriptions prefer native notifications; when
//! registration is impossible or fails, delivery switches once to a
//! polling loop that feeds the same data event, so callers cannot tell
//! the mechanisms apart.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::events::EventSink;
use crate::domain::models::{
    CharacteristicDescriptor, ConnectionState, DeliveryMode, NotificationSubscription, WriteMode,
};
use crate::error::{CharacteristicError, ConnectionError, CoreError};
use crate::infrastructure::bluetooth::connection::{
    ActiveSubscription, ConnectionSession, SessionShared, SubscriptionInfo, SubscriptionMap,
};
use crate::infrastructure::bluetooth::radio::RadioPeer;
use crate::infrastructure::bridge::{AsyncBridge, StopToken};

pub struct CommunicationChannel {
    session: Arc<ConnectionSession>,
    shared: Arc<SessionShared>,
    subscriptions: Arc<SubscriptionMap>,
    bridge: Arc<AsyncBridge>,
    gate: Arc<tokio::sync::Mutex<()>>,
    sink: Arc<dyn EventSink>,
    poll_interval: Duration,
}

impl CommunicationChannel {
    pub(crate) fn new(
        session: Arc<ConnectionSession>,
        bridge: Arc<AsyncBridge>,
        gate: Arc<tokio::sync::Mutex<()>>,
        sink: Arc<dyn EventSink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: session.shared(),
            subscriptions: session.subscriptions(),
            session,
            bridge,
            gate,
            sink,
            poll_interval,
        }
    }

    /// Reads the characteristic and delivers the bytes through
    /// `on_data_received`. Interpretation of the payload is the
    /// caller's concern.
    pub fn read(&self, characteristic: Uuid) -> Result<(), CoreError> {
        let (peer, descriptor) = self.prepare(characteristic)?;
        if !descriptor.properties.readable() {
            return Err(CharacteristicError::NotReadable(characteristic).into());
        }

        let session = self.session.clone();
        let gate = self.gate.clone();
        let sink = self.sink.clone();
        let _handle = self.bridge.submit(move |_stop| async move {
            let outcome = {
                let _gate = gate.lock().await;
                peer.read(characteristic).await
            };
            match outcome {
                Ok(payload) => {
                    sink.on_data_received(characteristic, &payload);
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

    /// Writes raw bytes. Confirmed write is used whenever the
    /// characteristic declares it; write-without-response otherwise.
    pub fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), CoreError> {
        let (peer, descriptor) = self.prepare(characteristic)?;
        let mode = if descriptor.properties.write {
            WriteMode::WithResponse
        } else if descriptor.properties.write_without_response {
            WriteMode::WithoutResponse
        } else {
            return Err(CharacteristicError::NotWritable(characteristic).into());
        };

        let session = self.session.clone();
        let gate = self.gate.clone();
        let payload = payload.to_vec();
        let _handle = self.bridge.submit(move |_stop| async move {
            let outcome = {
                let _gate = gate.lock().await;
                peer.write(characteristic, &payload, mode).await
            };
            match outcome {
                Ok(()) => {
                    debug!(%characteristic, ?mode, len = payload.len(), "write completed");
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

    /// Starts delivery for the characteristic, replacing any existing
    /// subscription for it. Native notifications are attempted when the
    /// property set allows; every other case polls.
    pub fn subscribe(&self, characteristic: Uuid) -> Result<(), CoreError> {
        let (peer, descriptor) = self.prepare(characteristic)?;

        // Replace semantics: stop the old delivery before the new one
        // starts, never stack two.
        let existing = self.subscriptions.lock().unwrap().remove(&characteristic);
        if let Some(existing) = existing {
            existing.handle.cancel();
        }

        let try_native = descriptor.properties.notifiable();
        let info = Arc::new(SubscriptionInfo {
            characteristic,
            poll_interval: self.poll_interval,
            mode: Mutex::new(if try_native {
                DeliveryMode::Native
            } else {
                DeliveryMode::Polling
            }),
        });

        let session = self.session.clone();
        let gate = self.gate.clone();
        let sink = self.sink.clone();
        let poll_interval = self.poll_interval;
        let task_info = info.clone();
        let handle = self.bridge.submit(move |stop| {
            deliver(
                peer,
                characteristic,
                try_native,
                task_info,
                session,
                gate,
                sink,
                poll_interval,
                stop,
            )
        });

        self.subscriptions
            .lock()
            .unwrap()
            .insert(characteristic, ActiveSubscription { info, handle });
        Ok(())
    }

    /// Stops whichever delivery mechanism is active for the
    /// characteristic. Blocks until the task has fully exited; a no-op
    /// when nothing is subscribed.
    pub fn unsubscribe(&self, characteristic: Uuid) {
        let existing = self.subscriptions.lock().unwrap().remove(&characteristic);
        if let Some(subscription) = existing {
            subscription.handle.cancel();
            debug!(%characteristic, "subscription stopped");
        }
    }

    /// Snapshot of the active subscription for a characteristic, if any.
    pub fn subscription(&self, characteristic: Uuid) -> Option<NotificationSubscription> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(&characteristic)
            .map(|sub| NotificationSubscription {
                characteristic: sub.info.characteristic,
                mode: *sub.info.mode.lock().unwrap(),
                poll_interval: sub.info.poll_interval,
            })
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Connected-state and catalog lookup shared by every operation.
    /// Transition windows fail busy instead of queuing.
    fn prepare(
        &self,
        characteristic: Uuid,
    ) -> Result<(Arc<dyn RadioPeer>, CharacteristicDescriptor), CoreError> {
        let st = self.shared.state.lock().unwrap();
        match st.state {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected => return Err(ConnectionError::NotConnected.into()),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                return Err(ConnectionError::Busy.into())
            }
        }
        let peer = st.peer.clone().ok_or(ConnectionError::NotConnected)?;
        let descriptor = st
            .catalog
            .as_ref()
            .and_then(|services| {
                services
                    .iter()
                    .flat_map(|service| &service.characteristics)
                    .find(|c| c.uuid == characteristic)
                    .cloned()
            })
            .ok_or(CharacteristicError::Unknown(characteristic))?;
        Ok((peer, descriptor))
    }
}

/// Delivery loop for one subscription: native stream when registration
/// succeeds, polling substitute otherwise. Both feed the same event.
#[allow(clippy::too_many_arguments)]
async fn deliver(
    peer: Arc<dyn RadioPeer>,
    characteristic: Uuid,
    try_native: bool,
    info: Arc<SubscriptionInfo>,
    session: Arc<ConnectionSession>,
    gate: Arc<tokio::sync::Mutex<()>>,
    sink: Arc<dyn EventSink>,
    poll_interval: Duration,
    mut stop: StopToken,
) -> Result<(), CoreError> {
    let stream = if try_native {
        let attempt = {
            let _gate = gate.lock().await;
            peer.start_notifications(characteristic).await
        };
        match attempt {
            Ok(stream) => Some(stream),
            Err(err) => {
                info!(%characteristic, %err, "native subscription failed, falling back to polling");
                None
            }
        }
    } else {
        None
    };

    match stream {
        Some(mut stream) => {
            debug!(%characteristic, "native notifications active");
            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    item = stream.next() => match item {
                        Some(payload) => sink.on_data_received(characteristic, &payload),
                        // The stack closed the stream underneath us.
                        None => break,
                    }
                }
            }
            let _gate = gate.lock().await;
            if let Err(err) = peer.stop_notifications(characteristic).await {
                debug!(%characteristic, %err, "failed to clear native subscription");
            }
        }
        None => {
            *info.mode.lock().unwrap() = DeliveryMode::Polling;
            debug!(%characteristic, interval = ?poll_interval, "polling delivery active");
            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                if stop.is_stopped() {
                    break;
                }
                let outcome = {
                    let _gate = gate.lock().await;
                    peer.read(characteristic).await
                };
                match outcome {
                    Ok(payload) => sink.on_data_received(characteristic, &payload),
                    Err(err) if err.is_transport_loss() => {
                        session.mark_lost();
                        return Err(err);
                    }
                    // Transient read failures are normal while polling.
                    Err(err) => debug!(%characteristic, %err, "poll read failed"),
                }
            }
        }
    }
    Ok(())
}
