//! Ordered session event stream.
//!
//! Every component holds a clone of the same [`EventSink`]; the receiver end
//! sees events in emission order. Each event is also logged.

use driftline_core::{EventKind, SessionEvent};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Sending side of the session event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    /// Creates a sink and its receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx }, rx)
    }

    /// A sink nobody listens to. Events are still logged.
    pub fn detached() -> Self {
        let (sink, _rx) = Self::channel();
        sink
    }

    /// Emits an event without detail.
    pub fn emit(&self, kind: EventKind) {
        self.push(SessionEvent::now(kind, None));
    }

    /// Emits an event with a human-readable detail.
    pub fn emit_with(&self, kind: EventKind, detail: impl Into<String>) {
        self.push(SessionEvent::now(kind, Some(detail.into())));
    }

    fn push(&self, event: SessionEvent) {
        let detail = event.detail.as_deref().unwrap_or("");
        if event.is_problem() {
            warn!(kind = %event.kind, detail, "Session event");
        } else {
            info!(kind = %event.kind, detail, "Session event");
        }
        // A closed receiver only means nobody is watching.
        let _ = self.tx.send(event);
    }
}
