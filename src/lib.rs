//! Per-application profile accumulation and export.
//!
//! Samples are ingested from any thread into one accumulator per
//! application. Export cycles swap each accumulator's buffer out, serialize
//! it to a gzip-compressed pprof artifact and deliver it over HTTP or to disk.

pub mod accumulator;
pub mod application;
pub mod config;
pub mod delivery;
pub mod endpoint;
pub mod health;
pub mod pipeline;
pub mod profile;
pub mod registry;
pub mod scheduler;
pub mod tags;

pub use pipeline::{ApplicationOutcome, ExportFailure, ExportReport, ExporterSettings, ProfileExporter};
