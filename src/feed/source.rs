//! Source adapter: turns a feed URL into an ordered batch of unseen items.
//!
//! Dispatch is a closed set of variants chosen from the URL scheme:
//!
//! - `http` / `https`: fetched through the shared [`HttpClient`] and parsed as
//!   RSS or Atom.
//! - `example`: synthetic in-process sources used by tests and demos.
//!
//! Any other scheme fails with [`FetchError::UnsupportedScheme`].

use rand::Rng;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use super::fetcher::{FetchError, HttpClient};
use super::item::{item_id, Item};
use super::parser::parse_feed;

/// Identifier every synthetic source emits first.
pub const SYNTHETIC_OLD_ID: &str = "old_id";

const SYNTHETIC_PUBLISHED: &str = "2001-02-03 04:05:06";
const FLAKY_FAILURE_RATE: f64 = 0.3;

/// Behaviour of an `example://` source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synthetic {
    /// `example://test`: `old_id` plus a new random id on every call, instantly.
    Fresh,
    /// `example://static`: `old_id` plus an id fixed for the process lifetime.
    Static,
    /// `example://failing`: fails on every call.
    Failing,
    /// Any other `example://` URL: 1-2 s latency and a 30% failure rate.
    Flaky,
}

/// Where a feed's items come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Remote(Url),
    Synthetic(Synthetic),
}

impl Source {
    /// Picks the source implementation for `url` by scheme.
    pub fn resolve(url: &str) -> Result<Self, FetchError> {
        let parsed = Url::parse(url)?;

        match parsed.scheme() {
            "http" | "https" => Ok(Source::Remote(parsed)),
            "example" => {
                let kind = match parsed.host_str() {
                    Some("test") => Synthetic::Fresh,
                    Some("static") => Synthetic::Static,
                    Some("failing") => Synthetic::Failing,
                    _ => Synthetic::Flaky,
                };
                Ok(Source::Synthetic(kind))
            }
            scheme => Err(FetchError::UnsupportedScheme {
                scheme: scheme.to_string(),
                url: url.to_string(),
            }),
        }
    }

    async fn entries(&self, client: &HttpClient) -> Result<Vec<Item>, FetchError> {
        match self {
            Source::Remote(url) => {
                let body = client.get(url.as_str()).await?;
                parse_feed(&body).map_err(|e| FetchError::Parse(e.to_string()))
            }
            Source::Synthetic(kind) => synthetic_entries(*kind).await,
        }
    }
}

/// Fetches `url` and returns its entries minus those whose identity is in
/// `seen`, sorted oldest first.
///
/// Ordering is by parsed publication time, ties broken by identity. Entries
/// without a parseable timestamp sort before dated ones.
pub async fn fetch_items(
    url: &str,
    client: &HttpClient,
    seen: &HashSet<String>,
) -> Result<Vec<Item>, FetchError> {
    let source = Source::resolve(url)?;
    let entries = source.entries(client).await?;

    let mut keyed: Vec<(String, Item)> = entries
        .into_iter()
        .map(|item| (item_id(&item), item))
        .filter(|(id, _)| !seen.contains(id))
        .collect();
    keyed.sort_by(|(a_id, a), (b_id, b)| {
        a.published
            .cmp(&b.published)
            .then_with(|| a_id.cmp(b_id))
    });

    Ok(keyed.into_iter().map(|(_, item)| item).collect())
}

fn synthetic_entry(id: String) -> Item {
    Item {
        link: Some(format!("example://{}", id)),
        id: Some(id),
        title: Some("<example>".to_string()),
        published_raw: Some(SYNTHETIC_PUBLISHED.to_string()),
        published: None,
        summary: None,
    }
}

fn static_id() -> &'static str {
    static STATIC_ID: OnceLock<String> = OnceLock::new();
    STATIC_ID.get_or_init(|| Uuid::new_v4().to_string())
}

async fn synthetic_entries(kind: Synthetic) -> Result<Vec<Item>, FetchError> {
    let second = match kind {
        Synthetic::Fresh => Uuid::new_v4().to_string(),
        Synthetic::Static => static_id().to_string(),
        Synthetic::Failing => return Err(FetchError::Synthetic("source always fails")),
        Synthetic::Flaky => {
            let (delay_ms, fail) = {
                let mut rng = rand::rng();
                (rng.random_range(1000..=2000), rng.random_bool(FLAKY_FAILURE_RATE))
            };
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if fail {
                return Err(FetchError::Synthetic("eth0 on fire"));
            }
            Uuid::new_v4().to_string()
        }
    };

    Ok(vec![
        synthetic_entry(SYNTHETIC_OLD_ID.to_string()),
        synthetic_entry(second),
    ])
}
