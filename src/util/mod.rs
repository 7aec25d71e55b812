//! # Utility Modules
//!
//! Common helpers used throughout the dsmr-rs crate: hex encoding/decoding
//! for keys and frame dumps, and rate-limited logging for noisy links.

pub mod hex;
pub mod logging;

// Re-export commonly used types and functions
pub use hex::{decode_hex, encode_hex, encode_hex_upper, format_hex_compact};
pub use logging::{log_frame_hex, LogThrottle};
