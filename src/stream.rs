//! Per-consumer event streams
//!
//! A stream is a bounded broadcast channel: subscribers that fall behind lose
//! the oldest events rather than stalling the producer. A short replay window
//! lets a subscriber that joins late see what just happened.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::device::ServerDevice;
use crate::gatt::{CharacteristicId, ClientEvent};

struct StreamState<T> {
    /// `None` once the stream has been closed.
    tx: Option<broadcast::Sender<T>>,
    replay: VecDeque<T>,
}

struct Inner<T> {
    label: String,
    state: Mutex<StreamState<T>>,
    replay_len: usize,
    dropped: Arc<AtomicU64>,
}

/// Producer side of an event stream. Cloning shares the same stream.
pub struct EventStream<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> EventStream<T> {
    pub fn new(label: impl Into<String>, capacity: usize, replay_len: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                state: Mutex::new(StreamState {
                    tx: Some(tx),
                    replay: VecDeque::with_capacity(replay_len),
                }),
                replay_len,
                dropped: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an event to every current subscriber. Never blocks.
    pub fn emit(&self, event: T) {
        let mut state = self.lock();
        let Some(tx) = state.tx.clone() else {
            log::debug!("[{}] event emitted after close, dropped", self.inner.label);
            return;
        };
        if self.inner.replay_len > 0 {
            if state.replay.len() == self.inner.replay_len {
                state.replay.pop_front();
            }
            state.replay.push_back(event.clone());
        }
        // No receivers is fine: the replay window keeps the event.
        let _ = tx.send(event);
    }

    /// Subscribe, starting with the replay window.
    pub fn subscribe(&self) -> EventSubscription<T> {
        let state = self.lock();
        EventSubscription {
            label: self.inner.label.clone(),
            backlog: state.replay.clone(),
            rx: state.tx.as_ref().map(|tx| tx.subscribe()),
            dropped: Arc::clone(&self.inner.dropped),
        }
    }

    /// Subscribe to events emitted from now on only.
    pub fn subscribe_live(&self) -> EventSubscription<T> {
        let state = self.lock();
        EventSubscription {
            label: self.inner.label.clone(),
            backlog: VecDeque::new(),
            rx: state.tx.as_ref().map(|tx| tx.subscribe()),
            dropped: Arc::clone(&self.inner.dropped),
        }
    }

    /// Close the stream. Subscribers drain what they hold, then see the end.
    pub fn close(&self) {
        self.lock().tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().tx.is_none()
    }

    /// Events lost by lagging subscribers since the stream was created.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side of an event stream.
pub struct EventSubscription<T> {
    label: String,
    backlog: VecDeque<T>,
    rx: Option<broadcast::Receiver<T>>,
    dropped: Arc<AtomicU64>,
}

fn record_lag(label: &str, dropped: &AtomicU64, skipped: u64) {
    dropped.fetch_add(skipped, Ordering::Relaxed);
    log::warn!("[{}] subscriber lagged, {} oldest events dropped", label, skipped);
}

impl<T: Clone> EventSubscription<T> {
    /// Wait for the next event. `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    record_lag(&self.label, &self.dropped, skipped)
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already available.
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            let rx = self.rx.as_mut()?;
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    record_lag(&self.label, &self.dropped, skipped)
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain every event currently available.
    pub fn drain(&mut self) -> Vec<T> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

/// A value pushed by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub value: Vec<u8>,
    /// `true` for an indication, which the client must acknowledge.
    pub confirm: bool,
}

/// Client events narrowed to the notifications of one characteristic.
///
/// Ends when the server disconnects or the client's stream closes.
pub struct NotificationStream {
    server: ServerDevice,
    characteristic: CharacteristicId,
    events: EventSubscription<ClientEvent>,
    ended: bool,
}

impl NotificationStream {
    pub fn new(
        server: ServerDevice,
        characteristic: CharacteristicId,
        events: EventSubscription<ClientEvent>,
    ) -> Self {
        Self {
            server,
            characteristic,
            events,
            ended: false,
        }
    }

    pub fn server(&self) -> &ServerDevice {
        &self.server
    }

    pub fn characteristic(&self) -> CharacteristicId {
        self.characteristic
    }

    pub async fn next(&mut self) -> Option<Notification> {
        if self.ended {
            return None;
        }
        while let Some(event) = self.events.recv().await {
            match event {
                ClientEvent::CharacteristicChanged {
                    server,
                    characteristic,
                    value,
                    confirm,
                } if server == self.server && characteristic == self.characteristic => {
                    return Some(Notification { value, confirm });
                }
                other if other.is_disconnect_from(&self.server) => break,
                _ => {}
            }
        }
        self.ended = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery() {
        let stream = EventStream::new("test", 16, 0);
        let mut sub = stream.subscribe();
        for i in 0..5 {
            stream.emit(i);
        }
        for i in 0..5 {
            assert_eq!(sub.recv().await, Some(i));
        }
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_replay_window() {
        let stream = EventStream::new("test", 16, 3);
        for i in 0..5 {
            stream.emit(i);
        }
        let mut late = stream.subscribe();
        stream.emit(5);
        assert_eq!(late.drain(), vec![2, 3, 4, 5]);

        let mut live = stream.subscribe_live();
        assert_eq!(live.try_recv(), None);
        stream.emit(6);
        assert_eq!(live.recv().await, Some(6));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let stream = EventStream::new("test", 4, 0);
        let mut sub = stream.subscribe();
        for i in 0..10 {
            stream.emit(i);
        }
        assert_eq!(sub.drain(), vec![6, 7, 8, 9]);
        assert_eq!(stream.dropped_events(), 6);
    }

    #[tokio::test]
    async fn test_notification_stream_filters() {
        use crate::gatt::event::{ConnectionState, GattStatus};
        use crate::gatt::uuid::uuid16;

        let stream = EventStream::new("client", 16, 0);
        let server = ServerDevice::new("server");
        let other = ServerDevice::new("other");
        let level = CharacteristicId::new(uuid16(0x180F), uuid16(0x2A19));
        let name = CharacteristicId::new(uuid16(0x1800), uuid16(0x2A00));
        let mut notifications = NotificationStream::new(server.clone(), level, stream.subscribe());

        let changed = |server: &ServerDevice, characteristic: CharacteristicId, value: u8| {
            ClientEvent::CharacteristicChanged {
                server: server.clone(),
                characteristic,
                value: vec![value],
                confirm: false,
            }
        };
        stream.emit(changed(&other, level, 1));
        stream.emit(changed(&server, name, 2));
        stream.emit(changed(&server, level, 3));
        stream.emit(ClientEvent::ConnectionStateChanged {
            server: server.clone(),
            status: GattStatus::Success,
            state: ConnectionState::Disconnected,
        });
        stream.emit(changed(&server, level, 4));

        assert_eq!(
            notifications.next().await,
            Some(Notification {
                value: vec![3],
                confirm: false
            })
        );
        assert_eq!(notifications.next().await, None);
        assert_eq!(notifications.next().await, None);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let stream = EventStream::new("test", 4, 0);
        let mut sub = stream.subscribe();
        stream.emit(1);
        stream.close();
        stream.emit(2);
        assert!(stream.is_closed());
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
    }
}
