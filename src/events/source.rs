//! Live event sources
//!
//! Anything that can push `LedgerEvent`s implements `EventSource`. A
//! connection is a stream; when it ends or yields an error the listener
//! treats it as dropped and reconnects with backoff.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use genealogy_types::NodeId;
use tokio::sync::{broadcast, watch};

use super::types::LedgerEvent;
use crate::error::StreamError;

pub type EventStream = BoxStream<'static, Result<LedgerEvent, StreamError>>;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a push connection on behalf of `root`'s tracker
    async fn connect(&self, root: &NodeId) -> Result<EventStream, StreamError>;
}

/// In-process push channel backed by a broadcast channel.
///
/// Connections can be refused or dropped on demand, which is what the
/// reconnect tests and the CLI demo drive.
pub struct ChannelEventSource {
    sender: broadcast::Sender<LedgerEvent>,
    /// Bumped to end every open connection
    drop_tx: watch::Sender<u64>,
    refuse: AtomicBool,
    connect_attempts: AtomicUsize,
}

impl Default for ChannelEventSource {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChannelEventSource {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (drop_tx, _) = watch::channel(0);
        Self {
            sender,
            drop_tx,
            refuse: AtomicBool::new(false),
            connect_attempts: AtomicUsize::new(0),
        }
    }

    /// Push an event to every open connection; returns how many received it
    pub fn publish(&self, event: LedgerEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Refuse (or accept again) new connections
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// End every open connection
    pub fn drop_connections(&self) {
        self.drop_tx.send_modify(|generation| *generation += 1);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn connect(&self, root: &NodeId) -> Result<EventStream, StreamError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(StreamError::ConnectionRefused(format!("push channel refused {root}")));
        }

        let events = self.sender.subscribe();
        let dropped = self.drop_tx.subscribe();
        let stream = futures::stream::unfold(
            (events, dropped, false),
            |(mut events, mut dropped, done)| async move {
                if done {
                    return None;
                }
                tokio::select! {
                    _ = dropped.changed() => None,
                    received = events.recv() => match received {
                        Ok(event) => Some((Ok(event), (events, dropped, false))),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            Some((Err(StreamError::Lagged(skipped)), (events, dropped, true)))
                        }
                        Err(broadcast::error::RecvError::Closed) => None,
                    },
                }
            },
        );
        Ok(stream.boxed())
    }
}
