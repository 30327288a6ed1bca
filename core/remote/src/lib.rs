//! Remote backend collaborator for offsync.
//!
//! The offline core needs two capabilities from the server side: replaying
//! captured HTTP-shaped requests, and typed table operations for entity
//! sync. `RemoteBackend` bundles both; `RestBackend` speaks PostgREST and
//! `MemoryBackend` is an in-process double for tests.

pub mod backend;
pub mod memory;
pub mod query;
pub mod rest;

pub use backend::{row_id, HttpRequest, HttpResponse, RemoteBackend};
pub use memory::{Failure, MemoryBackend, RecordedCall};
pub use query::{Filter, FilterOp, OrderBy, Query};
pub use rest::{RestBackend, RestConfig};
