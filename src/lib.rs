//! feedreader: polls RSS and Atom feeds on independent schedules,
//! deduplicates entries and fans new ones out to subscribers.
//!
//! - [`feed`] - the polling engine and everything it drives
//! - [`config`] - optional TOML configuration
//! - [`output`] - formatting of delivered items for the terminal
//! - [`util`] - text helpers

pub mod config;
pub mod feed;
pub mod output;
pub mod util;
