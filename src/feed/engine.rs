//! The per-feed polling engine.
//!
//! A [`Feed`] owns one URL's schedule, its seen-id set and its subscriber set.
//! Once started it runs an unsupervised loop on its own Tokio task:
//!
//! ```text
//!  Idle --(subscribers > 0)--> Polling --ok--> Sleeping(interval) --+
//!   ^                            |                                   |
//!   |                            +--err--> RetryWait(min(60s, interval))
//!   +-----------------------------------------------------------------+
//! ```
//!
//! Every wait and the fetch itself race the feed's cancellation token, so
//! [`Feed::shutdown`] ends the loop at the next suspension point.
//!
//! Shared state, by field:
//!
//! - seen ids and the discard-initial flag live behind an async mutex that only
//!   [`Feed::update`] takes, which also serializes concurrent updates.
//! - subscribers live behind an `RwLock`; registration writes, the broadcaster
//!   reads a snapshot.
//! - interval, state and failure count are atomics.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::fetcher::{FetchError, HttpClient};
use super::item::Item;
use super::source::fetch_items;
use super::subscriber::{Envelope, Subscriber, SubscriberId};

/// Default time between successful polls.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
/// Upper bound on the wait after a failed poll.
pub const RETRY_DELAY: Duration = Duration::from_secs(60);
/// How often an unsubscribed feed re-checks for subscribers.
pub const IDLE_CHECK: Duration = Duration::from_secs(1);

/// Construction options for a [`Feed`].
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Time between successful polls, whole seconds (minimum 1).
    pub interval: Duration,
    /// Deliver the items present on the first poll instead of only marking
    /// them seen.
    pub include_initial: bool,
    /// Spawn the polling loop immediately. When false the feed is only driven
    /// by [`Feed::update`] until [`Feed::start`] is called.
    pub autostart: bool,
    pub retry_ceiling: Duration,
    pub idle_check: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            include_initial: false,
            autostart: true,
            retry_ceiling: RETRY_DELAY,
            idle_check: IDLE_CHECK,
        }
    }
}

/// Where a feed's loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FeedState {
    /// Loop not started; only manual updates happen.
    Manual = 0,
    /// No subscribers; waiting to re-check.
    Idle = 1,
    /// Fetch in flight.
    Polling = 2,
    /// Waiting out the interval after a successful poll.
    Sleeping = 3,
    /// Waiting out the backoff after a failed poll.
    RetryWait = 4,
    /// Cancelled.
    Stopped = 5,
}

impl FeedState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FeedState::Idle,
            2 => FeedState::Polling,
            3 => FeedState::Sleeping,
            4 => FeedState::RetryWait,
            5 => FeedState::Stopped,
            _ => FeedState::Manual,
        }
    }
}

struct DedupState {
    seen: HashSet<String>,
    discard_next_update: bool,
}

struct FeedInner {
    url: String,
    client: HttpClient,
    interval_secs: AtomicU64,
    retry_ceiling: Duration,
    idle_check: Duration,
    dedup: tokio::sync::Mutex<DedupState>,
    subscribers: RwLock<Vec<(SubscriberId, Arc<dyn Subscriber>)>>,
    next_subscriber_id: AtomicU64,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A self-refreshing feed.
///
/// `Feed` is a handle: clones share the same schedule, dedup state and
/// subscribers, and compare equal. Envelopes carry a clone so consumers can
/// tell feeds apart.
///
/// ```ignore
/// let feed = Feed::new("https://example.com/rss", FeedOptions::default(), client);
/// let (_id, mut rx) = feed.subscribe_channel(64);
/// while let Some(envelope) = rx.recv().await {
///     println!("{}: {:?}", envelope.feed, envelope.item.title);
/// }
/// ```
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

impl Feed {
    /// Creates a feed and, if `options.autostart` is set, spawns its loop.
    ///
    /// Spawning requires a Tokio runtime context.
    pub fn new(url: impl Into<String>, options: FeedOptions, client: HttpClient) -> Self {
        let feed = Self {
            inner: Arc::new(FeedInner {
                url: url.into(),
                client,
                interval_secs: AtomicU64::new(options.interval.as_secs().max(1)),
                retry_ceiling: options.retry_ceiling,
                idle_check: options.idle_check,
                dedup: tokio::sync::Mutex::new(DedupState {
                    seen: HashSet::new(),
                    discard_next_update: !options.include_initial,
                }),
                subscribers: RwLock::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(1),
                state: AtomicU8::new(FeedState::Manual as u8),
                consecutive_failures: AtomicU32::new(0),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        };

        if options.autostart {
            feed.start();
        }
        feed
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.inner.interval_secs.load(Ordering::Relaxed))
    }

    /// Changes the polling interval (whole seconds, minimum 1).
    ///
    /// Known limitation: a sleep already in progress keeps the interval it
    /// started with; the new value applies from the next poll onwards.
    pub fn set_interval(&self, interval: Duration) {
        self.inner
            .interval_secs
            .store(interval.as_secs().max(1), Ordering::Relaxed);
    }

    pub fn state(&self) -> FeedState {
        FeedState::from_u8(self.inner.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: FeedState) {
        self.inner.state.store(state as u8, Ordering::Relaxed);
    }

    /// Scheduled polls that failed since the last successful one.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Backoff after a failed scheduled poll: `min(retry ceiling, interval)`.
    pub fn retry_delay(&self) -> Duration {
        self.inner.retry_ceiling.min(self.interval())
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    /// Registers a subscriber; it receives envelopes from the next broadcast on.
    pub fn subscribe<S>(&self, subscriber: S) -> SubscriberId
    where
        S: Subscriber + 'static,
    {
        let id = SubscriberId(self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(subscriber)));
        tracing::debug!(feed = %self, subscriber = %id, "Subscriber added");
        id
    }

    /// Registers a new bounded queue and returns its receiving end.
    pub fn subscribe_channel(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (self.subscribe(tx), rx)
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        let removed = subscribers.len() != before;
        if removed {
            tracing::debug!(feed = %self, subscriber = %id, "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sends every item to every subscriber registered right now.
    ///
    /// Delivery never blocks; a full or closed queue loses the envelope and
    /// the remaining subscribers are unaffected.
    fn broadcast(&self, items: &[Arc<Item>]) {
        if items.is_empty() {
            return;
        }

        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for item in items {
            for (id, subscriber) in &subscribers {
                let envelope = Envelope {
                    feed: self.clone(),
                    item: Arc::clone(item),
                };
                if let Err(e) = subscriber.try_deliver(envelope) {
                    tracing::warn!(
                        feed = %self,
                        subscriber = %id,
                        error = %e,
                        "Failed to enqueue item"
                    );
                }
            }
        }
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Fetches the feed once and delivers items not seen before.
    ///
    /// Every fetched identity is recorded as seen. On the first call of a feed
    /// built with `include_initial = false` nothing is delivered and an empty
    /// vector is returned. Errors from the source are returned as-is; unlike
    /// the scheduled loop, a manual call does not retry.
    pub async fn update(&self) -> Result<Vec<Arc<Item>>, FetchError> {
        let mut dedup = self.inner.dedup.lock().await;
        let fetched = fetch_items(&self.inner.url, &self.inner.client, &dedup.seen).await?;

        let DedupState {
            seen,
            discard_next_update,
        } = &mut *dedup;

        let mut fresh: Vec<Arc<Item>> = fetched
            .into_iter()
            .filter(|item| seen.insert(item.identity()))
            .map(Arc::new)
            .collect();

        if *discard_next_update {
            *discard_next_update = false;
            tracing::debug!(feed = %self, discarded = fresh.len(), "Discarding initial items");
            fresh.clear();
        }

        self.broadcast(&fresh);
        Ok(fresh)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawns the polling loop. Returns false if it is already running or the
    /// feed was shut down.
    pub fn start(&self) -> bool {
        let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.inner.cancel.is_cancelled() {
            return false;
        }
        self.set_state(FeedState::Idle);
        *task = Some(tokio::spawn(self.clone().run()));
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Asks the loop to exit at its next suspension point.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        if !self.is_running() {
            self.set_state(FeedState::Stopped);
        }
    }

    /// Shuts the loop down and waits for its task to finish.
    pub async fn stop(&self) {
        self.shutdown();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(feed = %self, error = %e, "Feed task ended abnormally");
            }
        }
        self.set_state(FeedState::Stopped);
    }

    async fn run(self) {
        let cancel = self.inner.cancel.clone();
        tracing::debug!(feed = %self, "Feed loop started");

        loop {
            let delay = if self.subscriber_count() == 0 {
                self.set_state(FeedState::Idle);
                tracing::debug!(feed = %self, "Nobody is subscribed, waiting");
                self.inner.idle_check
            } else {
                self.set_state(FeedState::Polling);
                tracing::debug!(feed = %self, "Updating feed");

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = self.update() => result,
                };

                match result {
                    Ok(items) => {
                        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
                        tracing::debug!(feed = %self, delivered = items.len(), "Updated feed");
                        self.set_state(FeedState::Sleeping);
                        self.interval()
                    }
                    Err(e) => {
                        let retry = self.retry_delay();
                        let failures = self
                            .inner
                            .consecutive_failures
                            .fetch_add(1, Ordering::Relaxed)
                            .saturating_add(1);
                        tracing::warn!(
                            feed = %self,
                            error = %e,
                            failures = failures,
                            retry_in_secs = retry.as_secs(),
                            "Unable to update feed, retrying"
                        );
                        self.set_state(FeedState::RetryWait);
                        retry
                    }
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(FeedState::Stopped);
        tracing::info!(feed = %self, "Feed loop stopped");
    }
}

impl PartialEq for Feed {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Feed {}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Feed<url='{}', interval={}>",
            self.inner.url,
            self.inner.interval_secs.load(Ordering::Relaxed)
        )
    }
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("url", &self.inner.url)
            .field("interval", &self.interval())
            .field("state", &self.state())
            .finish()
    }
}
