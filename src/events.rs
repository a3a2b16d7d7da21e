//! Events published by the procedure for UI drivers.
//!
//! The procedure never renders anything. It publishes phase changes, status
//! text, countdown progress and errors on a Tokio `broadcast` channel, and any
//! number of front ends subscribe. Publishing with no subscribers is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::procedure::{RemainingTime, RunState};

/// Capacity of the event channel. Slow subscribers lag rather than block.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something a UI driver should show.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ShowerEvent {
    /// The procedure moved between run states.
    StateChanged {
        /// State before the transition.
        from: RunState,
        /// State after the transition.
        to: RunState,
    },
    /// Human-readable status line, e.g. "Removing Detectors".
    Status(String),
    /// Countdown progress after a tick.
    Progress(RemainingTime),
    /// An error, already logged, for display.
    Error(String),
}

/// Sending half of the event channel.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: broadcast::Sender<ShowerEvent>,
}

impl EventSender {
    /// Creates a new channel.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// New receiver seeing events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ShowerEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event; dropped silently when nobody listens.
    pub fn send(&self, event: ShowerEvent) {
        let _ = self.tx.send(event);
    }

    /// Publishes a status line.
    pub fn status(&self, message: impl Into<String>) {
        self.send(ShowerEvent::Status(message.into()));
    }

    /// Publishes an error line.
    pub fn error(&self, message: impl Into<String>) {
        self.send(ShowerEvent::Error(message.into()));
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let events = EventSender::new();
        let mut rx = events.subscribe();

        events.status("Removing Detectors");
        events.error("boom");

        assert_eq!(
            rx.recv().await.unwrap(),
            ShowerEvent::Status("Removing Detectors".into())
        );
        assert_eq!(rx.recv().await.unwrap(), ShowerEvent::Error("boom".into()));
    }

    #[test]
    fn sending_without_subscribers_is_fine() {
        EventSender::new().status("nobody listening");
    }
}
