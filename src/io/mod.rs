//! Output files: line format, stores and the reader.

mod format;
mod reader;
mod store;

pub use format::{shard_path, OutputLine, RunMetadata, RunStatus, StageInfo};
pub use reader::OutputReader;
pub use store::{FileStore, MemoryOutput, MemoryStore, OutputStore};
