//! Identifier generation.

use uuid::Uuid;

/// Generates a new UUID v7 (time-ordered).
///
/// Job ids use v7 so that ids created later sort later.
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}

/// Generates an opaque correlation id for work submitted without one.
#[must_use]
pub fn generate_correlation_id() -> String {
    format!("corr-{}", Uuid::new_v4().simple())
}
