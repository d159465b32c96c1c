//! Soil telemetry ingestion: storage port with file and PostgreSQL
//! backends, the ingestion pipeline, OTA status tracking and live fan-out.

pub mod batching;
pub mod command;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod notify;
pub mod ota;
pub mod pipeline;
pub mod rest;
pub mod store;
pub mod validate;
