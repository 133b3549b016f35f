//! # CompileFlow Core
//!
//! Shared, I/O-free logic for the CompileFlow extraction pipeline: data
//! models, consecutive-page grouping, field-schema construction and
//! validation, chunk windowing and merging, the template store
//! abstraction, vector utilities, and CSV export.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem code. Every
//! function here is deterministic, which is what lets the pipeline's
//! grouping, windowing, threshold, and merge rules be tested in isolation.

pub mod chunk;
pub mod csv;
pub mod embedding;
pub mod matching;
pub mod models;
pub mod schema;
pub mod segment;
pub mod store;
