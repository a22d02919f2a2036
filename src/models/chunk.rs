// src/models/chunk.rs

use serde::{Deserialize, Serialize};

/// Metadata stored alongside every chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Storage key of the source document
    pub source: String,
    pub chunk_index: usize,
    pub title: String,
    pub text_preview: String,
    pub chunk_length: usize,
    /// `{key}-{chunk_index}`, also the record id
    pub document_id: String,
}

/// A piece of document text ready for upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl ChunkRecord {
    pub fn new(key: &str, title: &str, index: usize, text: String, preview_chars: usize) -> Self {
        let metadata = ChunkMetadata {
            source: key.to_string(),
            chunk_index: index,
            title: title.to_string(),
            text_preview: text.chars().take(preview_chars).collect(),
            chunk_length: text.chars().count(),
            document_id: format!("{key}-{index}"),
        };
        Self { text, metadata }
    }

    pub fn id(&self) -> &str {
        &self.metadata.document_id
    }
}
