//! Which transports are up, and how to use them

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use wcsa_core::TransportKind;

/// Published state of a running transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    /// Shell snippet telling a client how to reach the agent
    pub help: String,
}

/// Change notifications from the board
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Ready(TransportKind),
    Stopped(TransportKind),
}

/// Shared registry of running transports
#[derive(Clone)]
pub struct StatusBoard {
    entries: Arc<DashMap<TransportKind, TransportStatus>>,
    events: broadcast::Sender<StatusEvent>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            entries: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Mark `kind` as running until the returned guard is dropped
    pub fn publish(&self, kind: TransportKind, help: impl Into<String>) -> StatusGuard {
        self.entries.insert(kind, TransportStatus { help: help.into() });
        let _ = self.events.send(StatusEvent::Ready(kind));
        StatusGuard {
            board: self.clone(),
            kind,
        }
    }

    fn clear(&self, kind: TransportKind) {
        if self.entries.remove(&kind).is_some() {
            let _ = self.events.send(StatusEvent::Stopped(kind));
        }
    }

    pub fn get(&self, kind: TransportKind) -> Option<TransportStatus> {
        self.entries.get(&kind).map(|entry| entry.value().clone())
    }

    pub fn is_running(&self, kind: TransportKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Help text, or the message shown for a transport that is down
    pub fn help(&self, kind: TransportKind) -> String {
        match self.get(kind) {
            Some(status) => status.help,
            None => format!("{} agent doesn't work!", kind),
        }
    }

    /// Running transports in id order
    pub fn running(&self) -> Vec<TransportKind> {
        let mut kinds: Vec<_> = self.entries.iter().map(|entry| *entry.key()).collect();
        kinds.sort_by_key(|k| k.id());
        kinds
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }
}

/// Clears a transport's entry when dropped
#[must_use = "the transport is marked stopped when the guard is dropped"]
pub struct StatusGuard {
    board: StatusBoard,
    kind: TransportKind,
}

impl Drop for StatusGuard {
    fn drop(&mut self) {
        self.board.clear(self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_clear() {
        let board = StatusBoard::new();
        let mut events = board.subscribe();

        let guard = board.publish(TransportKind::Wsl, "export SSH_AUTH_SOCK=/tmp/x");
        assert!(board.is_running(TransportKind::Wsl));
        assert_eq!(board.help(TransportKind::Wsl), "export SSH_AUTH_SOCK=/tmp/x");
        assert_eq!(events.try_recv().unwrap(), StatusEvent::Ready(TransportKind::Wsl));

        drop(guard);
        assert!(!board.is_running(TransportKind::Wsl));
        assert_eq!(board.help(TransportKind::Wsl), "WSL agent doesn't work!");
        assert_eq!(events.try_recv().unwrap(), StatusEvent::Stopped(TransportKind::Wsl));
    }

    #[test]
    fn test_running_in_id_order() {
        let board = StatusBoard::new();
        let _a = board.publish(TransportKind::Xshell, "");
        let _b = board.publish(TransportKind::Cygwin, "");
        let _c = board.publish(TransportKind::Wsl, "");
        assert_eq!(
            board.running(),
            vec![TransportKind::Cygwin, TransportKind::Wsl, TransportKind::Xshell]
        );
    }
}
