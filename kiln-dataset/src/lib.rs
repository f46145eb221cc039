//! Dataset preparation for pottery LoRA training.
//!
//! Every command works on the `<root>/<label>/<image>` layout and skips images it cannot
//! read, reporting them in the returned [`Summary`].

pub mod augment;
pub mod cli;
pub mod curate;
pub mod download;
mod error;
pub mod layout;
pub mod prepare;
pub mod split;
pub mod stats;
pub mod visualize;

pub use error::{DatasetError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub processed: usize,
    pub failed: usize,
}
