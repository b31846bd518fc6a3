//! # kb-sync
//!
//! Incremental synchronization of a retrieval index with the knowledge
//! sources behind it.
//!
//! Source changes are detected by content hash, diffed at chunk level,
//! prioritized, and re-embedded by a worker pool; each batch becomes a new
//! index generation through an atomic pointer swap, and a canary check
//! rolls back generations that degrade retrieval quality.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌─────────┐   ┌──────────┐
//! │ Sources  │──▶│ Detector │──▶│ Update     │──▶│ Workers │──▶│   Swap   │
//! │ FS/push  │   │ hash+diff│   │ Queue      │   │ embed   │   │ + Canary │
//! └──────────┘   └────┬─────┘   └────────────┘   └─────────┘   └────┬─────┘
//!                     │                                             │
//!                     ▼                                             ▼
//!               ┌───────────┐                              ┌────────────────┐
//!               │ Hash Store│◀─────────────────────────────│ Generations    │
//!               └───────────┘                              │ (vector store) │
//!                                                          └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbsync init                       # create database
//! kbsync sync docs                  # one-shot sync of a configured source
//! kbsync watch docs --interval 30   # poll continuously
//! kbsync query "refund policy"
//! kbsync generations                # history; `kbsync rollback <gen>` to revert
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`chunk`] | Normalization, hashing and chunking |
//! | [`hash_store`] | Append-only content hash store |
//! | [`source`] | Source contract and filesystem source |
//! | [`detector`] | Change detection with debounce |
//! | [`diff`] | Chunk-level diff analysis |
//! | [`classify`] | Priority classification |
//! | [`queue`] | Priority update queue |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Generational vector store |
//! | [`worker`] | Batch reindex workers |
//! | [`swap`] | Atomic swap coordinator |
//! | [`quality`] | Canary gate and rollback handling |
//! | [`ledger`] | Dead letters, generation history, tombstones, alerts |
//! | [`engine`] | Wiring and operator interface |
//! | [`retry`] | Exponential backoff |
//! | [`stats`] | Engine counters and index overview |
//! | [`progress`] | Progress reporting on stderr |
//! | [`commands`] | `kbsync` command implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod classify;
pub mod commands;
pub mod config;
pub mod db;
pub mod detector;
pub mod diff;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod hash_store;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod quality;
pub mod queue;
pub mod retry;
pub mod source;
pub mod stats;
pub mod swap;
pub mod vector_store;
pub mod worker;
