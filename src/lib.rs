//! # docpipe
//!
//! A watched-folder pipeline for invoices and receipts.
//!
//! docpipe polls an inbox directory for dropped documents (PDF scans,
//! phone photos), extracts their text, parses and canonicalizes the
//! accounting fields, verifies the supplier against the public registry,
//! and routes every file to exactly one of three places: committed
//! production storage, the duplicate archive, or quarantine for manual
//! review. Every terminal outcome leaves a forensic JSONL record behind.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌────────────────────────────────┐   ┌──────────┐
//! │ Watcher │──▶│ Processor                      │──▶│  SQLite  │
//! │ (inbox) │   │ hash → extract → parse →       │   │ FTS5     │
//! └─────────┘   │ canonicalize → enrich → gate   │   └────┬─────┘
//!               └───────────┬────────────────────┘        │
//!                           ▼                             ▼
//!              output/ | duplicates/ | quarantine/   forensic.jsonl
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`watcher`] | Polling inbox watcher |
//! | [`hash`] | Content fingerprinting |
//! | [`extract`] | Embedded PDF text and OCR extraction |
//! | [`quality`] | Text-quality scoring |
//! | [`parser`] | Pattern-rule field extraction |
//! | [`canonical`] | VAT math and totals reconciliation |
//! | [`registry`] | Supplier registry client with TTL cache |
//! | [`ai_fallback`] | Optional model-assisted extraction |
//! | [`gate`] | Completeness gate |
//! | [`processor`] | Pipeline orchestration |
//! | [`storage`] | SQLite storage port |
//! | [`file_ops`] | Safe file moves |
//! | [`forensic`] | Forensic JSONL sink |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod ai_fallback;
pub mod canonical;
pub mod config;
pub mod db;
pub mod extract;
pub mod file_ops;
pub mod forensic;
pub mod gate;
pub mod hash;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod processor;
pub mod quality;
pub mod registry;
pub mod storage;
pub mod watcher;
