pub mod config;
pub mod duplicate;
pub mod embedding;
pub mod frame;
pub mod history;
pub mod pipeline;
pub mod quality;
pub mod report;
pub mod resolver;
pub mod scanner;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use duplicate::{DuplicateDetector, DuplicateGroup, GroupingStrategy};
pub use embedding::{ClipOnnxEmbedder, EmbeddingGenerator, ImageEmbedder};
pub use frame::FrameExtractor;
pub use history::{History, RestoreSelection};
pub use pipeline::{Deduplicator, RunPhase, RunProgress, RunReport};
pub use quality::QualityScorer;
pub use resolver::DuplicateResolver;
pub use scanner::VideoScanner;
pub use tool::{ProcessRunner, ToolRunner};
