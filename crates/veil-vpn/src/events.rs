//! Tunnel state-change events
//!
//! Each tunnel owns one [`EventBus`]. The bus is a bounded broadcast: a slow
//! subscriber loses the oldest pending events and the tunnel never blocks.
//! Closing the bus ends every subscription; `reopen` starts a fresh
//! lifecycle so a monitor can re-attach after a reconnect.

use crate::tunnel::TunnelState;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Pending events kept per subscriber before the oldest are dropped
pub const EVENT_BUFFER: usize = 16;

/// One state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub state: TunnelState,
    pub message: String,
    pub error: Option<String>,
}

impl StateChange {
    pub fn new(state: TunnelState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: impl ToString) -> Self {
        Self {
            state: TunnelState::Error,
            message: message.into(),
            error: Some(error.to_string()),
        }
    }
}

/// Per-tunnel event bus
pub struct EventBus {
    sender: Mutex<Option<broadcast::Sender<StateChange>>>,
    generation: watch::Sender<u64>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        let (generation, _) = watch::channel(0);
        Self {
            sender: Mutex::new(Some(sender)),
            generation,
        }
    }

    /// Publish without blocking; a closed bus drops the event.
    pub fn emit(&self, change: StateChange) {
        if let Some(sender) = self.sender.lock().as_ref() {
            // No subscribers is fine
            let _ = sender.send(change);
        }
    }

    /// Subscribe to the current lifecycle, if the bus is open.
    pub fn subscribe(&self) -> Option<StateChanges> {
        let sender = self.sender.lock();
        sender.as_ref().map(|s| StateChanges {
            receiver: s.subscribe(),
            generation: *self.generation.borrow(),
        })
    }

    /// End the current lifecycle. Idempotent.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            debug!("Tunnel event stream closed");
        }
    }

    /// Start a new lifecycle. Returns false when the bus is still open.
    pub fn reopen(&self) -> bool {
        let mut sender = self.sender.lock();
        if sender.is_some() {
            return false;
        }
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        *sender = Some(tx);
        self.generation.send_modify(|g| *g += 1);
        debug!("Tunnel event stream reopened");
        true
    }

    /// Current lifecycle number; bumped by every `reopen`.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Wait for a lifecycle newer than `generation` and subscribe to it.
    pub async fn next_lifecycle(&self, generation: u64) -> StateChanges {
        let mut watcher = self.generation.subscribe();
        loop {
            if *watcher.borrow_and_update() > generation {
                if let Some(changes) = self.subscribe() {
                    if changes.generation > generation {
                        return changes;
                    }
                }
            }
            // The sender lives in `self`, so this only fails if the bus is gone
            if watcher.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription to one lifecycle of a tunnel's events
pub struct StateChanges {
    receiver: broadcast::Receiver<StateChange>,
    generation: u64,
}

impl StateChanges {
    /// Next event, or `None` once the lifecycle is closed and drained.
    pub async fn recv(&mut self) -> Option<StateChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Dropped {} stale tunnel events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let mut changes = bus.subscribe().unwrap();

        bus.emit(StateChange::new(TunnelState::Connecting, "starting"));
        bus.emit(StateChange::new(TunnelState::Connected, "up"));

        assert_eq!(changes.recv().await.unwrap().state, TunnelState::Connecting);
        assert_eq!(changes.recv().await.unwrap().state, TunnelState::Connected);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = EventBus::new();
        let mut changes = bus.subscribe().unwrap();

        for i in 0..(EVENT_BUFFER + 4) {
            bus.emit(StateChange::new(TunnelState::Connecting, format!("{i}")));
        }
        bus.emit(StateChange::new(TunnelState::Connected, "last"));

        let first = changes.recv().await.unwrap();
        assert_ne!(first.message, "0");

        let mut last = first;
        while let Ok(Some(change)) =
            tokio::time::timeout(std::time::Duration::from_millis(10), changes.recv()).await
        {
            last = change;
        }
        assert_eq!(last.state, TunnelState::Connected);
    }

    #[tokio::test]
    async fn test_close_ends_subscription_after_drain() {
        let bus = EventBus::new();
        let mut changes = bus.subscribe().unwrap();

        bus.emit(StateChange::new(TunnelState::Disconnected, "stopped"));
        bus.close();
        bus.close();

        assert!(bus.is_closed());
        assert!(bus.subscribe().is_none());
        assert_eq!(changes.recv().await.unwrap().state, TunnelState::Disconnected);
        assert!(changes.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reopen_only_when_closed() {
        let bus = EventBus::new();
        assert!(!bus.reopen());

        bus.close();
        assert!(bus.reopen());
        assert!(!bus.reopen());
        assert_eq!(bus.subscribe().unwrap().generation(), 1);
    }

    #[tokio::test]
    async fn test_next_lifecycle_waits_for_reopen() {
        let bus = std::sync::Arc::new(EventBus::new());
        let old = bus.subscribe().unwrap().generation();
        bus.close();

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.next_lifecycle(old).await.generation() })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        bus.reopen();
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
