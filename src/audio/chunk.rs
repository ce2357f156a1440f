//! Indexed audio chunks

use std::sync::Arc;

use crate::audio::pcm::BYTES_PER_SAMPLE;

/// Immutable unit of captured audio shared between pipeline stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Position within the session, increasing by one per chunk
    pub index: u32,
    /// PCM16LE mono samples
    pub data: Arc<[u8]>,
    /// Last chunk of the session
    pub is_final: bool,
}

impl AudioChunk {
    /// Build a chunk from owned PCM bytes
    #[must_use]
    pub fn new(index: u32, data: Vec<u8>, is_final: bool) -> Self {
        Self {
            index,
            data: data.into(),
            is_final,
        }
    }

    /// Number of samples carried
    #[must_use]
    pub fn samples(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    /// Whether the chunk carries no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
