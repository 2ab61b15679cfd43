//! Clock and identifier helpers shared across the crate.

pub mod timestamps;
mod uuid_utils;

pub use timestamps::{format_rfc3339, now_utc, Timestamp};
pub use uuid_utils::{generate_correlation_id, generate_uuid_v7};
