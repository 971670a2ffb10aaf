//! Live event listener with reconnect backoff.
//!
//! One listener per tracked root. Every event is handed to the sink; the
//! sink decides what to invalidate and refresh. When the connection cannot
//! be (re)established within `max_retries` attempts the channel is marked
//! degraded on the root's polling state and the listener exits; polling
//! carries on alone.

use std::sync::Arc;

use futures::StreamExt;
use genealogy_types::NodeId;
use tokio::sync::watch;

use super::source::EventSource;
use super::types::LedgerEvent;
use crate::config::StreamConfig;
use crate::scheduler::SharedPollingState;

/// Receives every event delivered over the connection
pub type EventSink = Arc<dyn Fn(LedgerEvent) + Send + Sync>;

pub struct StreamListener {
    root: NodeId,
    source: Arc<dyn EventSource>,
    config: StreamConfig,
    state: SharedPollingState,
    sink: EventSink,
}

impl StreamListener {
    pub fn new(
        root: NodeId,
        source: Arc<dyn EventSource>,
        config: StreamConfig,
        state: SharedPollingState,
        sink: EventSink,
    ) -> Self {
        Self {
            root,
            source,
            config,
            state,
            sink,
        }
    }

    /// Run until shutdown or until the reconnect budget is spent.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let connected = tokio::select! {
                result = self.source.connect(&self.root) => result,
                _ = shutdown_rx.changed() => break,
            };

            match connected {
                Ok(mut stream) => {
                    if attempt > 0 {
                        tracing::info!(root = %self.root, attempt, "Live channel reconnected");
                    } else {
                        tracing::info!(root = %self.root, "Live channel connected");
                    }
                    attempt = 0;
                    self.state.lock().stream_retry_count = 0;

                    loop {
                        tokio::select! {
                            next = stream.next() => match next {
                                Some(Ok(event)) => (self.sink)(event),
                                Some(Err(e)) => {
                                    tracing::warn!(root = %self.root, error = %e, "Live channel error");
                                    break;
                                }
                                None => break,
                            },
                            _ = shutdown_rx.changed() => {
                                tracing::debug!(root = %self.root, "Live channel closed on shutdown");
                                return;
                            }
                        }
                    }
                    tracing::info!(root = %self.root, "Live channel dropped");
                }
                Err(e) => {
                    tracing::warn!(root = %self.root, attempt, error = %e, "Live channel connect failed");
                }
            }

            attempt += 1;
            if attempt > self.config.max_retries {
                {
                    let mut state = self.state.lock();
                    state.stream_degraded = true;
                    state.stream_retry_count = self.config.max_retries;
                }
                tracing::warn!(
                    root = %self.root,
                    max_retries = self.config.max_retries,
                    "Live channel degraded, continuing on interval polling only"
                );
                return;
            }
            self.state.lock().stream_retry_count = attempt;

            let delay = self.config.reconnect_delay(attempt);
            tracing::debug!(root = %self.root, attempt, delay_ms = delay.as_millis() as u64, "Live channel reconnect scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::debug!(root = %self.root, "Live channel listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollingConfig;
    use crate::events::{ChannelEventSource, LedgerEventKind};
    use crate::scheduler::PollingState;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    fn listener(
        source: Arc<ChannelEventSource>,
        seen: Arc<Mutex<Vec<LedgerEvent>>>,
    ) -> (StreamListener, SharedPollingState) {
        let state = SharedPollingState::new(PollingState::new(PollingConfig::default(), Instant::now()));
        let sink: EventSink = Arc::new(move |e: LedgerEvent| seen.lock().unwrap().push(e));
        let listener = StreamListener::new(
            NodeId::new("root"),
            source,
            StreamConfig::default(),
            state.clone(),
            sink,
        );
        (listener, state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrades_after_retry_budget() {
        let source = Arc::new(ChannelEventSource::default());
        source.refuse_connections(true);
        let (listener, state) = listener(source.clone(), Arc::default());
        let (_tx, rx) = watch::channel(false);

        let started = Instant::now();
        listener.run(rx).await;

        // 1 initial attempt + 5 retries at 5s, 10s, 20s, 40s, 80s
        assert_eq!(source.connect_attempts(), 6);
        assert_eq!(started.elapsed(), Duration::from_secs(155));
        let state = state.lock();
        assert!(state.stream_degraded);
        assert_eq!(state.stream_retry_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_events_and_stops_on_shutdown() {
        let source = Arc::new(ChannelEventSource::default());
        let seen: Arc<Mutex<Vec<LedgerEvent>>> = Arc::default();
        let (listener, state) = listener(source.clone(), seen.clone());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(listener.run(rx));

        while source.open_connections() == 0 {
            tokio::task::yield_now().await;
        }
        source.publish(LedgerEvent::new(LedgerEventKind::UserRegistered, None));
        while seen.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!state.lock().stream_degraded);
    }
}
