//! PostgREST (Supabase REST) backend.
//!
//! - `apikey` plus bearer authentication
//! - `Prefer: return=representation` on writes so the server echoes rows
//! - per-request timeout (30 s by default)

pub mod backend;
pub mod client;

pub use backend::RestBackend;
pub use client::{RestClient, RestConfig, DEFAULT_TIMEOUT_SECS};
