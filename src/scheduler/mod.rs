//! Adaptive Polling Scheduler
//!
//! One task per tracked root:
//!
//! ```text
//!   ┌──────────── tick (deadline) ────────────┐
//!   │  evaluate idle timeout                  │
//!   │  poll target (fetch/cache pipeline)     │
//!   │  next deadline = now + interval(state)  │◄── state re-read every tick
//!   └─────────────────────────────────────────┘
//!   refresh requests (manual / live events) ──► poll now, deadline untouched
//!   shutdown ──► Stopped, in-flight poll dropped
//! ```
//!
//! A poll runs inside the same `select!` as the shutdown signal, so a fetch
//! that resolves after teardown never gets to publish its result.

mod state;

pub use state::{PollingState, SchedulerState, SharedPollingState, Transition};

use std::sync::Arc;

use async_trait::async_trait;
use genealogy_types::NodeId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Why a poll happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollReason {
    /// Regular timer tick; a fresh cache entry is good enough
    Tick,
    /// A new subscriber joined; a fresh cache entry is good enough
    Subscribe,
    /// Consumer asked for a refresh
    Manual,
    /// Live event hit this root
    Event,
}

impl PollReason {
    /// Forced polls bypass the cache
    pub fn is_forced(&self) -> bool {
        matches!(self, PollReason::Manual | PollReason::Event)
    }
}

/// Out-of-band poll request
#[derive(Debug)]
pub struct RefreshRequest {
    pub reason: PollReason,
    /// Signalled once the poll finished
    pub done: Option<oneshot::Sender<()>>,
}

/// What the scheduler drives on every tick
#[async_trait]
pub trait PollTarget: Send + Sync {
    async fn poll(&self, root: &NodeId, reason: PollReason);
}

pub struct RootScheduler {
    root: NodeId,
    state: SharedPollingState,
    target: Arc<dyn PollTarget>,
    refresh_rx: mpsc::Receiver<RefreshRequest>,
}

impl RootScheduler {
    pub fn new(
        root: NodeId,
        state: SharedPollingState,
        target: Arc<dyn PollTarget>,
        refresh_rx: mpsc::Receiver<RefreshRequest>,
    ) -> Self {
        Self {
            root,
            state,
            target,
            refresh_rx,
        }
    }

    /// Run the polling loop until the shutdown signal is received.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(root = %self.root, "Polling scheduler started");
        let mut next_tick = Instant::now();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,

                _ = tokio::time::sleep_until(next_tick) => {
                    let transition = self.state.lock().evaluate(Instant::now());
                    if let Some((from, to)) = transition {
                        tracing::info!(root = %self.root, from = from.as_str(), to = to.as_str(), "Polling state changed");
                    }
                    if !self.poll(PollReason::Tick, &mut shutdown_rx).await {
                        break;
                    }
                    let (interval, state) = {
                        let state = self.state.lock();
                        (state.interval(), state.state())
                    };
                    let Some(interval) = interval else { break };
                    next_tick = Instant::now() + interval;
                    tracing::trace!(
                        root = %self.root,
                        state = state.as_str(),
                        interval_ms = interval.as_millis() as u64,
                        "Next poll scheduled"
                    );
                }

                request = self.refresh_rx.recv() => {
                    let Some(request) = request else { break };
                    let completed = self.poll(request.reason, &mut shutdown_rx).await;
                    if let Some(done) = request.done {
                        let _ = done.send(());
                    }
                    if !completed {
                        break;
                    }
                }
            }
        }

        if let Some((from, _)) = self.state.lock().stop() {
            tracing::info!(root = %self.root, from = from.as_str(), "Polling scheduler stopped");
        }
    }

    /// Poll once; returns false when shutdown arrived first (result discarded)
    async fn poll(&self, reason: PollReason, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = self.target.poll(&self.root, reason) => true,
            _ = shutdown_rx.changed() => {
                tracing::debug!(root = %self.root, ?reason, "Poll discarded on teardown");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollingConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        polls: Mutex<Vec<(Instant, PollReason)>>,
    }

    #[async_trait]
    impl PollTarget for Recorder {
        async fn poll(&self, _root: &NodeId, reason: PollReason) {
            self.polls.lock().unwrap().push((Instant::now(), reason));
        }
    }

    fn spawn_scheduler(
        recorder: Arc<Recorder>,
    ) -> (SharedPollingState, mpsc::Sender<RefreshRequest>, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let state = SharedPollingState::new(PollingState::new(PollingConfig::default(), Instant::now()));
        let (refresh_tx, refresh_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = RootScheduler::new(NodeId::new("root"), state.clone(), recorder, refresh_rx);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));
        (state, refresh_tx, shutdown_tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_immediately_then_on_interval() {
        let recorder = Arc::new(Recorder::default());
        let start = Instant::now();
        let (_state, _refresh, shutdown, handle) = spawn_scheduler(recorder.clone());

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let offsets: Vec<u64> = recorder
            .polls
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| (*at - start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 5, 10]);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_does_not_move_deadline() {
        let recorder = Arc::new(Recorder::default());
        let start = Instant::now();
        let (_state, refresh, shutdown, handle) = spawn_scheduler(recorder.clone());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let (done_tx, done_rx) = oneshot::channel();
        refresh
            .send(RefreshRequest {
                reason: PollReason::Manual,
                done: Some(done_tx),
            })
            .await
            .unwrap();
        done_rx.await.unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let polls: Vec<(u64, PollReason)> = recorder
            .polls
            .lock()
            .unwrap()
            .iter()
            .map(|(at, r)| ((*at - start).as_secs(), *r))
            .collect();
        assert_eq!(
            polls,
            vec![(0, PollReason::Tick), (2, PollReason::Manual), (5, PollReason::Tick)]
        );

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_state() {
        let recorder = Arc::new(Recorder::default());
        let (state, _refresh, shutdown, handle) = spawn_scheduler(recorder.clone());
        tokio::task::yield_now().await;

        shutdown.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(state.lock().state(), SchedulerState::Stopped);

        let polls = recorder.polls.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(recorder.polls.lock().unwrap().len(), polls);
    }
}
