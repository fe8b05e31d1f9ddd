//! Utility functions for common operations.
//!
//! - **Text processing**: Unicode-aware width, wrapping and control-character stripping
//! - **Dates**: lenient parsing of feed timestamps

mod dates;
mod text;

pub use dates::parse_timestamp;
pub use text::{display_width, strip_control_chars, wrap_to_width};
