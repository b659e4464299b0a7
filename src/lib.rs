//! # semindex: semantic index for source trees
//!
//! Splits files into semantically bounded chunks, embeds them and stores
//! chunk, vector and full text together so a tree can be searched by
//! similarity or by keyword. Re-runs only touch files whose content changed.
//!
//! ## Architecture
//!
//! - **[`chunker`]**: Chunk model, per-format chunkers and the extension registry
//! - **[`indexer`]**: File discovery, content-hash gating and the `IndexManager` pipeline
//! - **[`db`]**: Storage contract and its SQLite + sqlite-vec + FTS5 backend
//! - **[`embedder`]**: Embedding contract, keyword embedder and offline fallback
//! - **[`config`]**: JSON configuration with defaults and validation

pub mod chunker;
pub mod config;
pub mod db;
pub mod embedder;
pub mod indexer;
