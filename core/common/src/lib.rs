//! Common utilities and types shared across the offsync crates.
//!
//! This module provides the error taxonomy and the small value types that
//! every layer (store, remote backend, sync manager, gateway) agrees on.

pub mod error;
pub mod types;

pub use error::{ConflictDetails, Error, Result};
pub use types::{checksum, ClientId, ConcurrencyToken, HttpMethod};
