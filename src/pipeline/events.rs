//! Progress events emitted at every increment transition.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::planner::IncrementStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineEvent {
    pub increment_index: usize,
    pub status: IncrementStatus,
    /// Free text: the agent id, the failure reason, the feedback, ...
    pub detail: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub agent_id: Option<String>,
}

/// Synchronous progress callback. Runs inline at the transition, before the
/// pipeline moves on.
pub type EventObserver = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

/// Sending half of the event stream. Observers may go away at any time;
/// emitting to a closed stream is silently dropped.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
    observers: Vec<EventObserver>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("channel", &self.tx.is_some())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                observers: Vec::new(),
            },
            rx,
        )
    }

    /// A sink with no channel; events are only logged.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Also call `observer` for every event.
    pub fn with_observer(mut self, observer: impl Fn(&PipelineEvent) + Send + Sync + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn emit(&self, event: PipelineEvent) {
        info!(
            increment = event.increment_index,
            status = %event.status,
            attempt = event.attempt,
            agent_id = event.agent_id.as_deref().unwrap_or("-"),
            "{}",
            event.detail
        );
        for observer in &self.observers {
            observer(&event);
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(index: usize) -> PipelineEvent {
        PipelineEvent {
            increment_index: index,
            status: IncrementStatus::InProgress,
            detail: "started".into(),
            attempt: 1,
            agent_id: None,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(event(0));
        sink.emit(event(1));
        drop(sink);

        assert_eq!(rx.recv().await.unwrap().increment_index, 0);
        assert_eq!(rx.recv().await.unwrap().increment_index, 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn observers_run_before_the_channel_delivers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let (sink, mut rx) = EventSink::channel();
        let sink = sink.with_observer(move |e| {
            counter.fetch_add(e.increment_index + 1, Ordering::SeqCst);
        });

        sink.emit(event(2));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(rx.recv().await.unwrap().increment_index, 2);

        EventSink::disabled()
            .with_observer({
                let seen = Arc::clone(&seen);
                move |_| {
                    seen.fetch_add(10, Ordering::SeqCst);
                }
            })
            .emit(event(0));
        assert_eq!(seen.load(Ordering::SeqCst), 13);
    }

    #[test]
    fn closed_receiver_is_ignored() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(event(0));
        EventSink::disabled().emit(event(1));
    }
}
