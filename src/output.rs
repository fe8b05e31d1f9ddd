//! Terminal output for delivered items.
//!
//! Each envelope is printed as a block:
//!
//! ```text
//! 2024-01-01 00:00:00+00:00
//! Feed<url='https://example.com/rss', interval=300>
//!   A title, wrapped at seventy columns with continuation lines
//!   indented by two spaces
//!   https://example.com/post
//!
//! ```

use std::io::{self, Write};
use tokio::sync::mpsc;

use crate::feed::Envelope;
use crate::util::{parse_timestamp, strip_control_chars, wrap_to_width};

/// Column width used when wrapping titles.
pub const TITLE_WIDTH: usize = 70;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

fn format_date(envelope: &Envelope) -> String {
    let item = &envelope.item;
    if let Some(published) = item.published {
        return published.format(DATE_FORMAT).to_string();
    }
    match item.published_raw.as_deref() {
        Some(raw) => match parse_timestamp(raw) {
            Some(parsed) => parsed.format(DATE_FORMAT).to_string(),
            None => strip_control_chars(raw).into_owned(),
        },
        None => "unknown date".to_string(),
    }
}

/// Renders one envelope as a printable block, ending in a newline.
pub fn format_envelope(envelope: &Envelope) -> String {
    let item = &envelope.item;
    let title = strip_control_chars(item.title.as_deref().unwrap_or("(untitled)"));
    let title_lines = wrap_to_width(&title, TITLE_WIDTH).join("\n  ");
    let link = strip_control_chars(item.link.as_deref().unwrap_or(""));

    format!(
        "{}\n{}\n  {}\n  {}\n",
        format_date(envelope),
        envelope.feed,
        title_lines,
        link
    )
}

/// Drains `rx`, writing each envelope to `out`, until every sender is gone.
///
/// Returns the number of envelopes written. A closed output (e.g. a broken
/// pipe) ends the printer with an error.
pub async fn run_printer<W: Write>(
    mut rx: mpsc::Receiver<Envelope>,
    mut out: W,
) -> io::Result<usize> {
    let mut printed = 0;
    while let Some(envelope) = rx.recv().await {
        writeln!(out, "{}", format_envelope(&envelope))?;
        out.flush()?;
        printed += 1;
    }
    tracing::debug!(printed = printed, "Output queue closed");
    Ok(printed)
}
