#![forbid(unsafe_code)]
//! Feature plugins.
//!
//! Each plugin implements [`ctn_core::Feature`] for one incompat bit and is
//! driven through [`ctn_core::SingleFeature`], which owns argument parsing
//! and the two-phase open.

mod inline_data;

pub use inline_data::{InlineData, InlineScan, expand_inline_data, find_inline_data};
