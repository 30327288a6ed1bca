//! offsync data gateway
//!
//! Application-facing read and write surface. Reads prefer the backend and
//! fall back to the offline cache; writes made offline are queued for the
//! sync manager and reflected in later cached reads.

pub mod config;
pub mod gateway;
pub mod overlay;

pub use config::{GatewayConfig, GatewayResponse, ReadOptions, DEFAULT_TTL_MINUTES};
pub use gateway::{DataGateway, TableQuery};
