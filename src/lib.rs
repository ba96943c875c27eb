//! `listarchive`: load mailing list messages into a SQLite archive and
//! rebuild their reply threads.
//!
//! This crate provides the ingestion pipeline (message sources, parsing,
//! validation, storage with thread merging) and the thread reconstruction
//! used to display an archived thread.

pub mod analyzer;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod parser;
pub mod source;
pub mod store;
pub mod threading;
