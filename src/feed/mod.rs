//! Feed polling, deduplication and fan-out.
//!
//! - [`item`] - the [`Item`] value type and its deduplication key
//! - [`parser`] - RSS/Atom parsing using the `feed-rs` crate
//! - [`fetcher`] - shared HTTP client with a `Cache-Control` aware response cache
//! - [`source`] - scheme dispatch from a URL to an ordered batch of items
//! - [`subscriber`] - envelopes and the non-blocking subscriber seam
//! - [`engine`] - the self-driving [`Feed`]
//!
//! # Example
//!
//! ```ignore
//! use feedreader::feed::{Feed, FeedOptions, HttpClient};
//!
//! let client = HttpClient::new(256)?;
//! let feed = Feed::new("https://blog.rust-lang.org/feed.xml", FeedOptions::default(), client);
//! let (_id, mut rx) = feed.subscribe_channel(64);
//! ```

pub mod engine;
pub mod fetcher;
pub mod item;
pub mod parser;
pub mod source;
pub mod subscriber;

pub use engine::{Feed, FeedOptions, FeedState};
pub use fetcher::{FetchError, HttpClient, DEFAULT_CACHE_CAPACITY};
pub use item::{item_id, Item};
pub use source::{fetch_items, Source, SYNTHETIC_OLD_ID};
pub use subscriber::{DeliveryError, Envelope, Subscriber, SubscriberId};
