//! Observer fan-out.
//!
//! External collaborators (the HTTP surface, tests, a future UI layer) watch
//! the relay through this type: latest-value snapshots for polling plus a
//! broadcast channel for push consumers. Publishing never blocks on slow or
//! absent subscribers.

use crate::model::{DiagnosticsEvent, StatusEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone)]
pub enum RelayEvent {
    Status(StatusEvent),
    Diagnostics(DiagnosticsEvent),
}

pub struct Observer {
    status: RwLock<StatusEvent>,
    diagnostics: RwLock<Option<DiagnosticsEvent>>,
    events: broadcast::Sender<RelayEvent>,
}

impl Observer {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);

        Arc::new(Self {
            status: RwLock::new(StatusEvent::default()),
            diagnostics: RwLock::new(None),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub async fn publish_status(&self, event: StatusEvent) {
        *self.status.write().await = event.clone();
        let _ = self.events.send(RelayEvent::Status(event));
    }

    pub async fn publish_diagnostics(&self, event: DiagnosticsEvent) {
        *self.diagnostics.write().await = Some(event.clone());
        let _ = self.events.send(RelayEvent::Diagnostics(event));
    }

    pub async fn status(&self) -> StatusEvent {
        self.status.read().await.clone()
    }

    pub async fn diagnostics(&self) -> Option<DiagnosticsEvent> {
        self.diagnostics.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_tracks_latest_event() {
        tokio_test::block_on(async {
            let observer = Observer::new();
            assert_eq!(observer.status().await.status, "Stopped");
            assert!(observer.diagnostics().await.is_none());

            observer
                .publish_status(StatusEvent {
                    status: "Started".to_string(),
                    post_timestamp: String::new(),
                    post_payload: String::new(),
                })
                .await;

            assert_eq!(observer.status().await.status, "Started");
        });
    }

    #[test]
    fn test_broadcast_delivers_to_subscribers() {
        tokio_test::block_on(async {
            let observer = Observer::new();
            let mut rx = observer.subscribe();

            observer
                .publish_status(StatusEvent {
                    status: "Started".to_string(),
                    post_timestamp: String::new(),
                    post_payload: String::new(),
                })
                .await;

            match rx.recv().await.unwrap() {
                RelayEvent::Status(event) => assert_eq!(event.status, "Started"),
                other => panic!("expected status event, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        tokio_test::block_on(async {
            let observer = Observer::new();
            observer.publish_status(StatusEvent::default()).await;
        });
    }
}
