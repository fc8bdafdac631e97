use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, DropGuard};

use concord_types::Versioned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEventKind {
    Insert,
    Update,
    Remove,
}

/// A state change observed on a map.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEvent<K, V> {
    pub kind: MapEventKind,
    pub key: K,
    pub new_value: Option<Versioned<V>>,
    pub old_value: Option<Versioned<V>>,
}

impl<K, V> MapEvent<K, V> {
    /// Classify a change; `None` when both sides are absent.
    pub fn from_change(
        key: K,
        old_value: Option<Versioned<V>>,
        new_value: Option<Versioned<V>>,
    ) -> Option<Self> {
        let kind = match (&old_value, &new_value) {
            (None, Some(_)) => MapEventKind::Insert,
            (Some(_), Some(_)) => MapEventKind::Update,
            (Some(_), None) => MapEventKind::Remove,
            (None, None) => return None,
        };
        Some(MapEvent { kind, key, new_value, old_value })
    }
}

/// Keeps a listener task alive. Dropping the handle unregisters the listener.
pub struct ListenerHandle {
    _guard: DropGuard,
}

impl ListenerHandle {
    pub fn new(token: CancellationToken) -> Self {
        ListenerHandle { _guard: token.drop_guard() }
    }
}

/// Run `f` for every value received on `rx` until the handle is dropped or
/// the channel closes. Must be called from within a tokio runtime.
pub fn spawn_listener<T, F>(mut rx: broadcast::Receiver<T>, mut f: F) -> ListenerHandle
where
    T: Clone + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(event) => f(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "listener lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
    ListenerHandle::new(token)
}
