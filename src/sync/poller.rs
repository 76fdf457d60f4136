//! Background polling of one conversation's message list.
//!
//! Each open conversation gets one task that asks the backend for messages
//! above the feed's watermark on a fixed interval. A fetch is never started
//! while another one for the same conversation is outstanding, whether it was
//! started by the timer or by [`Poller::poll_now`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::MessagingBackend;
use crate::error::Result;
use crate::model::{ConversationId, Message, MessageId};
use crate::sync::feed::ConversationFeed;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Upper bound on pages fetched in one pass when catching up on a backlog.
const MAX_PAGES_PER_POLL: usize = 20;

#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// New messages were appended; listeners scroll to the end.
    Appended {
        conversation: ConversationId,
        messages: Vec<Message>,
        watermark: MessageId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Appended(usize),
    Idle,
    /// Another fetch was still outstanding.
    Skipped,
    /// The poller was stopped while the fetch was in flight; results dropped.
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    pub page_size: usize,
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct PollState {
    backend: Arc<dyn MessagingBackend>,
    conversation: ConversationId,
    page_size: usize,
    feed: Arc<Mutex<ConversationFeed>>,
    events: broadcast::Sender<FeedEvent>,
    in_flight: AtomicBool,
    stopped: AtomicBool,
}

impl PollState {
    async fn poll_once(&self) -> Result<PollOutcome> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!(conversation = %self.conversation, "poll skipped; fetch already in flight");
            return Ok(PollOutcome::Skipped);
        };

        let mut appended = Vec::new();
        for _ in 0..MAX_PAGES_PER_POLL {
            let after = self.feed.lock().await.watermark();
            let batch = match self
                .backend
                .fetch_messages_after(self.conversation, after, self.page_size)
                .await
            {
                Ok(batch) => batch,
                Err(err) if appended.is_empty() => return Err(err),
                Err(err) => {
                    // Earlier pages are already merged and must still be announced.
                    warn!(conversation = %self.conversation, ?err, "page fetch failed mid-backlog; rest follows next tick");
                    break;
                }
            };

            if self.stopped.load(Ordering::Acquire) {
                return Ok(PollOutcome::Stopped);
            }

            let full_page = batch.len() >= self.page_size;
            appended.extend(self.feed.lock().await.merge(batch));
            if !full_page {
                break;
            }
        }

        if appended.is_empty() {
            return Ok(PollOutcome::Idle);
        }

        let count = appended.len();
        let watermark = self.feed.lock().await.watermark();
        if let Some(watermark) = watermark {
            debug!(conversation = %self.conversation, count, %watermark, "appended polled messages");
            // No subscribers is fine; the feed itself is the source of truth.
            let _ = self.events.send(FeedEvent::Appended {
                conversation: self.conversation,
                messages: appended,
                watermark,
            });
        }
        Ok(PollOutcome::Appended(count))
    }
}

/// Handle to a running poll loop. Dropping it stops the loop.
pub struct Poller {
    state: Arc<PollState>,
    task: JoinHandle<()>,
}

impl Poller {
    /// Spawns the poll loop on the current runtime. The first poll runs
    /// immediately.
    pub fn start(
        backend: Arc<dyn MessagingBackend>,
        feed: ConversationFeed,
        config: PollerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let conversation = feed.conversation();
        let feed = Arc::new(Mutex::new(feed));

        let state = Arc::new(PollState {
            backend,
            conversation,
            page_size: config.page_size.max(1),
            feed,
            events,
            in_flight: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        let task = tokio::spawn(run(Arc::clone(&state), config.interval));
        info!(%conversation, interval_ms = config.interval.as_millis() as u64, "poller started");

        Self { state, task }
    }

    pub fn conversation(&self) -> ConversationId {
        self.state.conversation
    }

    pub fn feed(&self) -> Arc<Mutex<ConversationFeed>> {
        Arc::clone(&self.state.feed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.state.events.subscribe()
    }

    /// Polls right away unless a fetch is already outstanding.
    pub async fn poll_now(&self) -> Result<PollOutcome> {
        if self.state.stopped.load(Ordering::Acquire) {
            return Ok(PollOutcome::Stopped);
        }
        self.state.poll_once().await
    }

    pub fn is_running(&self) -> bool {
        !self.state.stopped.load(Ordering::Acquire) && !self.task.is_finished()
    }

    /// Cancels the loop. A fetch that is still in flight is abandoned and its
    /// result never reaches the feed.
    pub fn stop(&self) {
        if !self.state.stopped.swap(true, Ordering::AcqRel) {
            self.task.abort();
            info!(conversation = %self.state.conversation, "poller stopped");
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(state: Arc<PollState>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if state.stopped.load(Ordering::Acquire) {
            break;
        }

        match state.poll_once().await {
            Ok(PollOutcome::Stopped) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(conversation = %state.conversation, ?err, "poll failed; retrying next tick");
            }
        }
    }
}
