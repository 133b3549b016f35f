//! # CompileFlow
//!
//! Document classification, template matching, and structured field
//! extraction for trade paperwork (invoices, packing lists, bills of
//! lading, customs declarations).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Uploads/URLs │──▶│  Segmenter   │──▶│ Blob store   │
//! │  PDF/images  │   │ classify+cut │   │  excerpts    │
//! └──────┬───────┘   └──────────────┘   └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Orchestrator │──▶│  Templates   │──▶│   SQLite     │
//! │  tool loop   │   │ embed+match  │   │ templates,   │
//! └──────┬───────┘   └──────────────┘   │ jobs, turns  │
//!        ▼                              └──────────────┘
//! ┌──────────────┐
//! │  Extractor   │──▶ JSON / SSE partials / CSV
//! └──────────────┘
//! ```
//!
//! Pure logic (models, schemas, page grouping, chunk merging, ranking,
//! CSV) lives in `compileflow-core`; this crate adds providers, storage,
//! the HTTP API, and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`error`] | Pipeline error type |
//! | [`llm`] | Multimodal model abstraction (Gemini, scripted) |
//! | [`embedding`] | Embedding providers |
//! | [`pdf`] | Page counting and page extraction |
//! | [`blob`] | File storage |
//! | [`source`] | Upload decoding and URL fetching |
//! | [`classify`] | Single-document classification |
//! | [`segmenter`] | Splitting uploads into logical documents |
//! | [`suggest`] | Field suggestion |
//! | [`extract`] | Structured extraction, chunked and streamed |
//! | [`templates`] | Template save and match |
//! | [`tools`] | Orchestrator tools |
//! | [`agent`] | Orchestrator loop |
//! | [`pipeline`] | Wiring |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite template and job stores |

pub mod agent;
pub mod blob;
pub mod classify;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod llm;
pub mod migrate;
pub mod pdf;
pub mod pipeline;
pub mod segmenter;
pub mod server;
pub mod source;
pub mod sqlite_store;
pub mod suggest;
pub mod templates;
pub mod tools;
