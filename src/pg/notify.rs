//! LISTEN/NOTIFY subscriptions over one dedicated connection.
//!
//! The manager keeps a reference-counted set of *desired* channels and two
//! pending sets (to LISTEN, to UNLISTEN). A sync pass drains both sets in one
//! batched simple query; only one pass runs at a time. When the dedicated
//! connection dies every desired channel goes back to pending, subscribers
//! see [`Event::Disconnect`] and a background task re-syncs on a fresh
//! connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::connection::{
    Connect, Connection, ConnectionHooks, DestroyHook, NotificationHook, SHARED,
};
use crate::config::PgConfig;
use crate::error::{Error, Result};
use crate::sql::{quote_ident, Query};
use crate::types::TypeRegistry;

const EVENT_CAPACITY: usize = 1024;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// One `NotificationResponse`, payload parsed as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    /// `None` for an empty payload.
    pub payload: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Notification(Notification),
    /// The dedicated connection was lost; notifications may have been missed.
    Disconnect,
}

#[derive(Default)]
struct SubState {
    desired: HashMap<String, usize>,
    pending_listen: BTreeSet<String>,
    pending_unlisten: BTreeSet<String>,
    conn: Option<Connection>,
    /// A background re-sync task is running.
    retrying: bool,
    closed: bool,
}

impl SubState {
    fn settled(&self) -> bool {
        self.pending_listen.is_empty() && self.pending_unlisten.is_empty()
    }
}

struct Inner {
    config: Arc<PgConfig>,
    registry: Arc<TypeRegistry>,
    connector: Arc<dyn Connect>,
    state: Mutex<SubState>,
    sync_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<Event>,
    ready: watch::Sender<bool>,
    retry_delay: Duration,
}

/// LISTEN/NOTIFY manager. Cheap to clone.
#[derive(Clone)]
pub struct Notifications {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Notifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Notifications")
            .field("channels", &state.desired.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Notifications {
    pub(crate) fn new(
        config: Arc<PgConfig>,
        registry: Arc<TypeRegistry>,
        connector: Arc<dyn Connect>,
    ) -> Self {
        Self::with_retry_delay(config, registry, connector, RETRY_DELAY)
    }

    pub(crate) fn with_retry_delay(
        config: Arc<PgConfig>,
        registry: Arc<TypeRegistry>,
        connector: Arc<dyn Connect>,
        retry_delay: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                connector,
                state: Mutex::new(SubState::default()),
                sync_lock: tokio::sync::Mutex::new(()),
                events,
                ready,
                retry_delay,
            }),
        }
    }

    /// Listen on `channel` and wait until the server confirmed it.
    ///
    /// Dropping the returned [`Subscription`] unlistens once no other
    /// subscription for the channel remains.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        if self.is_closed() {
            return Err(Error::Destroyed("Notifications closed".to_string()));
        }
        let subscription = Subscription {
            manager: self.clone(),
            channel: channel.to_string(),
            events: self.inner.events.subscribe(),
        };
        self.add_listener(channel);
        self.sync().await?;
        Ok(subscription)
    }

    /// Every notification and disconnect, for all channels.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// All desired channels are confirmed on a live connection.
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub async fn wait_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        // The sender lives as long as `self`
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub(crate) fn connection(&self) -> Option<Connection> {
        self.inner.state.lock().conn.clone()
    }

    /// Drop every channel and terminate the dedicated connection. Later
    /// syncs fail and subscribers stop receiving.
    pub fn close(&self) {
        let conn = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.desired.clear();
            state.pending_listen.clear();
            state.pending_unlisten.clear();
            state.conn.take()
        };
        debug!("closing notifications");
        // Cleared above, so the destroy hook ignores this connection
        if let Some(conn) = conn {
            conn.destroy("Notifications closed");
        }
        self.inner.ready.send_replace(true);
        let _ = self.inner.events.send(Event::Disconnect);
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    fn add_listener(&self, channel: &str) {
        let mut state = self.inner.state.lock();
        let count = state.desired.entry(channel.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 && !state.pending_unlisten.remove(channel) {
            state.pending_listen.insert(channel.to_string());
        }
        if !state.settled() {
            self.inner.ready.send_replace(false);
        }
    }

    /// Returns `true` when a sync is needed.
    fn remove_listener(&self, channel: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(count) = state.desired.get_mut(channel) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        state.desired.remove(channel);
        if !state.pending_listen.remove(channel) {
            state.pending_unlisten.insert(channel.to_string());
        }
        if state.settled() {
            let live = state.conn.as_ref().is_some_and(|c| !c.is_destroyed());
            self.inner.ready.send_replace(live || state.desired.is_empty());
            false
        } else {
            true
        }
    }

    /// Drain the pending sets until nothing is left.
    pub async fn sync(&self) -> Result<()> {
        let _guard = self.inner.sync_lock.lock().await;

        loop {
            let (conn, listen, unlisten) = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(Error::Destroyed("Notifications closed".to_string()));
                }
                if state.settled() {
                    self.inner.ready.send_replace(true);
                    return Ok(());
                }
                let conn = match &state.conn {
                    Some(conn) if !conn.is_destroyed() => conn.clone(),
                    _ => {
                        let conn = self.open();
                        state.conn = Some(conn.clone());
                        conn
                    }
                };
                (
                    conn,
                    std::mem::take(&mut state.pending_listen),
                    std::mem::take(&mut state.pending_unlisten),
                )
            };

            let sql = listen
                .iter()
                .map(|c| format!("LISTEN {};", quote_ident(c)))
                .chain(unlisten.iter().map(|c| format!("UNLISTEN {};", quote_ident(c))))
                .collect::<Vec<_>>()
                .join(" ");
            debug!(connection = conn.id(), %sql, "syncing subscriptions");

            if let Err(e) = conn.exec_as(Query::new(sql), SHARED).await {
                let mut state = self.inner.state.lock();
                // Put back whatever still matters
                for channel in listen {
                    if state.desired.contains_key(&channel) {
                        state.pending_listen.insert(channel);
                    }
                }
                for channel in unlisten {
                    if !state.desired.contains_key(&channel) {
                        state.pending_unlisten.insert(channel);
                    }
                }
                self.inner.ready.send_replace(false);
                return Err(e);
            }
        }
    }

    fn open(&self) -> Connection {
        let on_notification: NotificationHook = {
            let events = self.inner.events.clone();
            Arc::new(move |process_id: i32, channel: String, payload: String| {
                let payload = if payload.is_empty() {
                    None
                } else {
                    match serde_json::from_str(&payload) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(%channel, error = %e, "dropping notification with malformed payload");
                            return;
                        }
                    }
                };
                // No receivers is fine
                let _ = events.send(Event::Notification(Notification {
                    process_id,
                    channel,
                    payload,
                }));
            })
        };
        let manager = Arc::downgrade(&self.inner);
        let on_destroy: DestroyHook = Box::new(move |id: u64, reason: &str| {
            if let Some(inner) = manager.upgrade() {
                Notifications { inner }.on_disconnect(id, reason);
            }
        });
        let hooks = ConnectionHooks {
            on_destroy: Some(on_destroy),
            on_notification: Some(on_notification),
        };

        Connection::spawn(
            Arc::clone(&self.inner.config),
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.connector),
            hooks,
        )
    }

    fn on_disconnect(&self, id: u64, reason: &str) {
        let resync = {
            let mut state = self.inner.state.lock();
            if state.conn.as_ref().map(Connection::id) != Some(id) {
                return;
            }
            state.conn = None;
            state.pending_unlisten.clear();
            state.pending_listen = state.desired.keys().cloned().collect();
            let resync = !state.desired.is_empty() && !state.retrying;
            if resync {
                state.retrying = true;
            }
            resync
        };

        warn!(connection = id, reason, "notification connection lost");
        self.inner.ready.send_replace(self.inner.state.lock().settled());
        let _ = self.inner.events.send(Event::Disconnect);

        if resync {
            let inner = Arc::downgrade(&self.inner);
            tokio::spawn(resync_loop(inner));
        }
    }
}

/// Retry sync until it succeeds or the manager is dropped.
async fn resync_loop(inner: Weak<Inner>) {
    loop {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = Notifications { inner };
        if manager.is_closed() {
            return;
        }
        let delay = manager.inner.retry_delay;
        match manager.sync().await {
            Ok(()) => {
                let mut state = manager.inner.state.lock();
                // Lost again while syncing, keep going
                if state.settled() {
                    state.retrying = false;
                    debug!("subscriptions restored");
                    return;
                }
                continue;
            }
            Err(e) => {
                warn!(error = %e, "subscription sync failed, retrying");
            }
        }
        drop(manager);
        tokio::time::sleep(delay).await;
    }
}

/// Notifications for one channel.
pub struct Subscription {
    manager: Notifications,
    channel: String,
    events: broadcast::Receiver<Event>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next notification on this channel. Notifications that overflowed the
    /// buffer are skipped with a warning.
    pub async fn recv(&mut self) -> Result<Notification> {
        loop {
            match self.events.recv().await {
                Ok(Event::Notification(n)) if n.channel == self.channel => return Ok(n),
                Ok(Event::Disconnect) if self.manager.is_closed() => {
                    return Err(Error::Destroyed("Notifications closed".to_string()));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Destroyed("Notification manager closed".to_string()));
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.manager.remove_listener(&self.channel) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            handle.spawn(async move {
                if let Err(e) = manager.sync().await {
                    warn!(error = %e, "unlisten failed");
                }
            });
        }
    }
}
