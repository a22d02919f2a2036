// src/lib.rs

//! Judgment harvester library.
//!
//! Crawls a court judgments archive into object storage and indexes the
//! stored documents into a vector store.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
