use feed_rs::parser::{self, ParseFeedError};

use super::item::Item;

/// Parses RSS or Atom bytes into [`Item`]s, in document order.
///
/// `feed-rs` does not keep the original date text, so `published_raw` is the
/// RFC 3339 rendering of the parsed timestamp (published, else updated).
///
/// Entries without a native id get `id: None` rather than the hash `feed-rs`
/// would otherwise invent, so they fall back to [`item_id`](super::item_id).
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<Item>, ParseFeedError> {
    let feed = parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build()
        .parse(bytes)?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated);
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));
            let id = if entry.id.trim().is_empty() {
                None
            } else {
                Some(entry.id)
            };

            Item {
                id,
                title: entry.title.map(|t| t.content),
                link,
                published_raw: published.map(|dt| dt.to_rfc3339()),
                published,
                summary,
            }
        })
        .collect();

    Ok(items)
}
