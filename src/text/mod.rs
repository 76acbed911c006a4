//! Text preparation for synthesis.

pub mod chunker;

pub use chunker::{ClauseChunker, sanitize};
