use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// A single feed entry, normalised from any source.
///
/// Items are value objects: once handed to subscribers they are shared behind
/// an `Arc` and never mutated again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    /// Native identifier (RSS `<guid>`, Atom `<id>`), if the source provides one.
    pub id: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    /// Publication timestamp exactly as the source presented it.
    pub published_raw: Option<String>,
    /// Parsed publication timestamp, used for ordering.
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

impl Item {
    /// Deduplication key for this item. See [`item_id`].
    pub fn identity(&self) -> String {
        item_id(self)
    }
}

/// Derives the deduplication key for a feed entry.
///
/// A non-empty native identifier is returned verbatim. Otherwise the key is the
/// lowercase hex SHA-256 of `"{title}|{published_raw}"`, where an absent title
/// or timestamp contributes an empty string. Entries lacking all three fields
/// therefore share one key and are treated as the same item.
pub fn item_id(item: &Item) -> String {
    if let Some(id) = item.id.as_deref() {
        if !id.is_empty() {
            return id.to_string();
        }
    }

    let input = format!(
        "{}|{}",
        item.title.as_deref().unwrap_or(""),
        item.published_raw.as_deref().unwrap_or("")
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
