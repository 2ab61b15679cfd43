//! Cooperative cancellation.
//!
//! This module provides:
//! - CancellationToken, polled at pipeline step boundaries
//! - CancellationRegistry, mapping running jobs to their tokens

mod registry;
mod token;

pub use registry::CancellationRegistry;
pub use token::CancellationToken;
