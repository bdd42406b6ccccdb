#![doc = "cf-inventory-core: inventory collection and fleet orchestration for cf-inventory."]

//! This crate holds all domain logic of cf-inventory; the `cf-inventory`
//! binary only parses arguments and configuration and calls in here.
//!
//! - Collector side: [`api`] (HTTPS client, pagination), [`cache`] (lookup
//!   caches), [`inventory`] and [`opsman`] (flattening into CSV via [`csv_sink`]).
//! - Orchestrator side: [`remote`] (ssh/local transports, payload encoding,
//!   file transfer) and [`fleet`] (workspace, launch, poll, collect, cleanup).
//! - Seams are traits in [`contract`]; mocks are exported under the
//!   `test-export-mocks` feature.

pub mod api;
pub mod cache;
pub mod config;
pub mod contract;
pub mod csv_sink;
pub mod fleet;
pub mod inventory;
pub mod opsman;
pub mod remote;
