use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::engine::Feed;
use super::item::Item;

/// The unit delivered to subscribers: an item tagged with the feed it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub feed: Feed,
    pub item: Arc<Item>,
}

/// Why a single subscriber did not receive an envelope.
///
/// Never propagated: the broadcaster logs it and moves on to the next
/// subscriber.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber queue is full")]
    Full,
    #[error("subscriber queue is closed")]
    Closed,
}

/// A consumer-owned sink that accepts envelopes without blocking.
pub trait Subscriber: Send + Sync {
    fn try_deliver(&self, envelope: Envelope) -> Result<(), DeliveryError>;
}

impl Subscriber for mpsc::Sender<Envelope> {
    fn try_deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

impl Subscriber for mpsc::UnboundedSender<Envelope> {
    fn try_deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.send(envelope).map_err(|_| DeliveryError::Closed)
    }
}

/// Handle returned by [`Feed::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub(crate) u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
