//! Near-duplicate video detection. Each video is reduced to one representative frame,
//! embedded with a CLIP image encoder, grouped by cosine similarity, and every group
//! keeps its highest quality copy while the rest move to a quarantine directory.

pub mod core;

pub use crate::core::*;
