//! Formatting and filesystem helpers.

pub mod format;
pub mod fs;

// Re-export commonly used functions at module level
pub use format::{file_name_from_url, format_age, format_bytes, truncate_string};
