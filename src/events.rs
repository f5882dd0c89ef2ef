//! Component event fan-out and attributed logging.
//!
//! Each realm carries an optional event listener and an optional log
//! listener. A component's events (and log sink requests) are routed to
//! the nearest ancestor realm with a bound listener; the tree walk itself
//! lives in [`realm`](crate::realm), this module holds the types and the
//! per-realm binding state.
//!
//! Binding is one-shot: a second `set_listener` while the first is alive
//! is ignored. A disconnected listener (dropped receiver) frees the slot.

use crate::constants::ROOT_REALM_SEGMENT;
use crate::namespace::ServiceRequest;
use chrono::{DateTime, Utc};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

// =============================================================================
// Event Types
// =============================================================================

/// Lifecycle moments published to event listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Start,
    Stop,
    DiagnosticsReady,
}

/// Who an event is about, as seen by a listener.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EventMoniker {
    /// Resolved component URL.
    pub url: String,
    /// Realm labels from the tree root down to the component's realm.
    pub realm_path: Vec<String>,
    /// Component instance id.
    pub instance_id: Uuid,
}

/// One event delivered to a bound listener.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ComponentEvent {
    pub kind: EventKind,
    pub moniker: EventMoniker,
    pub timestamp: DateTime<Utc>,
}

impl ComponentEvent {
    pub fn now(kind: EventKind, moniker: EventMoniker) -> Self {
        Self {
            kind,
            moniker,
            timestamp: Utc::now(),
        }
    }
}

/// Receiver end handed out when a listener binds.
pub type EventStream = mpsc::UnboundedReceiver<ComponentEvent>;

// =============================================================================
// Per-Realm Event Sink
// =============================================================================

/// The listener slot of one realm.
#[derive(Default)]
pub(crate) struct EventSink {
    listener: RwLock<Option<mpsc::UnboundedSender<ComponentEvent>>>,
}

impl EventSink {
    /// Binds a listener. Returns the stream on success, `None` if a live
    /// listener is already bound.
    pub fn set_listener(&self) -> Option<EventStream> {
        let mut slot = match self.listener.write() {
            Ok(slot) => slot,
            Err(_) => return None,
        };
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            debug!("event listener already bound, ignoring");
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        Some(rx)
    }

    /// True while a listener is bound and its receiver is alive.
    pub fn is_bound(&self) -> bool {
        self.listener
            .read()
            .map(|slot| slot.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Delivers an event to the bound listener, if any. Returns whether
    /// the event was accepted.
    pub fn emit(&self, event: ComponentEvent) -> bool {
        match self.listener.read() {
            Ok(slot) => match slot.as_ref() {
                Some(tx) => tx.send(event).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }
}

// =============================================================================
// Log Connector
// =============================================================================

/// A log sink request attributed to the realm it came from.
#[derive(Debug)]
pub struct AttributedLogSink {
    /// Realm path with the reserved top segment stripped, so log
    /// attribution lines up with event attribution.
    pub realm_path: Vec<String>,
    /// The component's original service request.
    pub request: ServiceRequest,
}

/// Stream of attributed log sink requests handed out on bind.
pub type LogSinkStream = mpsc::UnboundedReceiver<AttributedLogSink>;

/// The log listener slot of one realm. Same one-shot binding rules as
/// [`EventSink`].
#[derive(Default)]
pub(crate) struct LogConnector {
    listener: RwLock<Option<mpsc::UnboundedSender<AttributedLogSink>>>,
}

impl LogConnector {
    pub fn set_listener(&self) -> Option<LogSinkStream> {
        let mut slot = match self.listener.write() {
            Ok(slot) => slot,
            Err(_) => return None,
        };
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            debug!("log listener already bound, ignoring");
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        Some(rx)
    }

    pub fn is_bound(&self) -> bool {
        self.listener
            .read()
            .map(|slot| slot.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Forwards a component's log sink request, attributing it to
    /// `realm_path` with the reserved top segment removed.
    pub fn connect(&self, realm_path: &[String], request: ServiceRequest) -> bool {
        let attributed = AttributedLogSink {
            realm_path: attributed_path(realm_path),
            request,
        };
        match self.listener.read() {
            Ok(slot) => match slot.as_ref() {
                Some(tx) => tx.send(attributed).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }
}

/// Strips the reserved top realm segment from an attribution path.
pub(crate) fn attributed_path(realm_path: &[String]) -> Vec<String> {
    match realm_path.split_first() {
        Some((first, rest)) if first == ROOT_REALM_SEGMENT => rest.to_vec(),
        _ => realm_path.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::ServiceRequest;

    fn moniker(label: &str) -> EventMoniker {
        EventMoniker {
            url: format!("pkg://host/{label}"),
            realm_path: vec![label.to_string()],
            instance_id: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn test_second_listener_before_disconnect_is_ignored() {
        let sink = EventSink::default();
        let first = sink.set_listener();
        assert!(first.is_some());
        assert!(sink.set_listener().is_none());
        assert!(sink.is_bound());
    }

    #[tokio::test]
    async fn test_rebind_after_disconnect() {
        let sink = EventSink::default();
        let stream = sink.set_listener();
        drop(stream);
        assert!(!sink.is_bound());
        assert!(sink.set_listener().is_some());
    }

    #[tokio::test]
    async fn test_emit_reaches_bound_listener() {
        let sink = EventSink::default();
        let mut stream = sink.set_listener().unwrap();
        assert!(sink.emit(ComponentEvent::now(EventKind::Start, moniker("demo"))));
        let event = stream.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Start);
        assert_eq!(event.moniker.realm_path, vec!["demo".to_string()]);
    }

    #[test]
    fn test_emit_without_listener_is_dropped() {
        let sink = EventSink::default();
        assert!(!sink.emit(ComponentEvent::now(EventKind::Stop, moniker("demo"))));
    }

    #[tokio::test]
    async fn test_log_connector_strips_reserved_top_segment() {
        let connector = LogConnector::default();
        let mut stream = connector.set_listener().unwrap();

        let path = vec![ROOT_REALM_SEGMENT.to_string(), "sys".to_string()];
        assert!(connector.connect(
            &path,
            ServiceRequest {
                path: "/svc/LogSink".to_string(),
            },
        ));
        let sink = stream.recv().await.unwrap();
        assert_eq!(sink.realm_path, vec!["sys".to_string()]);
    }

    #[test]
    fn test_attributed_path_keeps_non_reserved_top() {
        let path = vec!["sys".to_string(), "net".to_string()];
        assert_eq!(attributed_path(&path), path);
    }
}
