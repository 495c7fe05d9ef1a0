//! Event plumbing.
//!
//! Two delivery paths share one listener discipline: registered callbacks
//! fire synchronously on the dispatching task, and a broadcast channel
//! fans the same events out to async subscribers. Listener add/remove
//! during an emission is deferred until the emission completes, so
//! callbacks may freely (de)register listeners without corrupting the
//! iteration.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::constants::FcType;
use crate::packet::Packet;

/// Handle returned by listener registration, used for removal.
pub type ListenerId = u64;

/// Events observable on a client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A decoded packet, after its registry side effects were applied.
    Packet(Arc<Packet>),
    /// The connection reached the active state.
    Connected,
    /// The connection dropped; a reconnect is pending unless manual.
    Disconnected,
    /// `disconnect()` was invoked; pending waits are cancelled.
    ManualDisconnect,
    /// The initial model and tag lists have both completed.
    ModelsLoaded,
}

/// Subscription key for callback listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// Packets of one kind, by wire type.
    Fc(FcType),
    /// Every event, packet or lifecycle.
    Any,
    Connected,
    Disconnected,
    ManualDisconnect,
    ModelsLoaded,
}

struct Entry<A> {
    id: ListenerId,
    callback: Box<dyn FnMut(&A) + Send>,
}

struct ListenerInner<K, A> {
    listeners: HashMap<K, Vec<Entry<A>>>,
    next_id: ListenerId,
    in_flight: usize,
    pending_add: Vec<(K, Entry<A>)>,
    removed: HashSet<ListenerId>,
}

/// Keyed callback registry with mutation deferred during emission.
pub(crate) struct ListenerSet<K, A> {
    inner: Mutex<ListenerInner<K, A>>,
}

impl<K: Clone + Eq + Hash, A> ListenerSet<K, A> {
    pub(crate) fn new() -> ListenerSet<K, A> {
        ListenerSet {
            inner: Mutex::new(ListenerInner {
                listeners: HashMap::new(),
                next_id: 1,
                in_flight: 0,
                pending_add: Vec::new(),
                removed: HashSet::new(),
            }),
        }
    }

    pub(crate) fn add(
        &self,
        key: K,
        callback: impl FnMut(&A) + Send + 'static,
    ) -> ListenerId {
        let mut inner = self.inner.lock().expect("listener lock");
        let id = inner.next_id;
        inner.next_id += 1;
        let entry = Entry { id, callback: Box::new(callback) };
        if inner.in_flight > 0 {
            inner.pending_add.push((key, entry));
        } else {
            inner.listeners.entry(key).or_default().push(entry);
        }
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) {
        let mut inner = self.inner.lock().expect("listener lock");
        if inner.in_flight > 0 {
            inner.removed.insert(id);
        } else {
            for entries in inner.listeners.values_mut() {
                entries.retain(|e| e.id != id);
            }
        }
    }

    /// Invoke the listeners for each key in order. Callbacks run outside
    /// the internal lock, so they may call [`add`]/[`remove`]; those
    /// mutations take effect once the whole emission completes.
    pub(crate) fn emit(&self, keys: &[K], arg: &A) {
        self.inner.lock().expect("listener lock").in_flight += 1;

        for key in keys {
            let mut batch = {
                let mut inner = self.inner.lock().expect("listener lock");
                inner.listeners.remove(key).unwrap_or_default()
            };

            for entry in &mut batch {
                (entry.callback)(arg);
            }

            let mut inner = self.inner.lock().expect("listener lock");
            let slot = inner.listeners.entry(key.clone()).or_default();
            let added_during = std::mem::take(slot);
            *slot = batch;
            slot.extend(added_during);
        }

        let mut inner = self.inner.lock().expect("listener lock");
        inner.in_flight -= 1;
        if inner.in_flight == 0 {
            let pending = std::mem::take(&mut inner.pending_add);
            for (k, entry) in pending {
                inner.listeners.entry(k).or_default().push(entry);
            }
            let removed = std::mem::take(&mut inner.removed);
            if !removed.is_empty() {
                for entries in inner.listeners.values_mut() {
                    entries.retain(|e| !removed.contains(&e.id));
                }
            }
        }
    }
}

/// Per-client event bus: callback listeners plus a broadcast fan-out.
pub struct EventBus {
    listeners: ListenerSet<EventKey, ClientEvent>,
    broadcast: broadcast::Sender<ClientEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> EventBus {
        let (broadcast, _) = broadcast::channel(512);
        EventBus { listeners: ListenerSet::new(), broadcast }
    }

    /// New broadcast subscription delivering every event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.broadcast.subscribe()
    }

    pub fn on(
        &self,
        key: EventKey,
        callback: impl FnMut(&ClientEvent) + Send + 'static,
    ) -> ListenerId {
        self.listeners.add(key, callback)
    }

    pub fn off(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    /// Emit a packet event: the type-specific listeners first, then the
    /// wildcard listeners, then the broadcast channel.
    pub(crate) fn emit_packet(&self, packet: &Arc<Packet>) {
        let event = ClientEvent::Packet(Arc::clone(packet));
        self.listeners.emit(&[EventKey::Fc(packet.fc_type), EventKey::Any], &event);
        let _ = self.broadcast.send(event);
    }

    pub(crate) fn emit_lifecycle(&self, event: ClientEvent) {
        let key = match &event {
            ClientEvent::Connected => EventKey::Connected,
            ClientEvent::Disconnected => EventKey::Disconnected,
            ClientEvent::ManualDisconnect => EventKey::ManualDisconnect,
            ClientEvent::ModelsLoaded => EventKey::ModelsLoaded,
            ClientEvent::Packet(packet) => {
                let packet = Arc::clone(packet);
                return self.emit_packet(&packet);
            }
        };
        self.listeners.emit(&[key, EventKey::Any], &event);
        let _ = self.broadcast.send(event);
    }
}
