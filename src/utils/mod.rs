//! Shared utility functions for puzzle-forge.

pub mod tags;

pub use tags::{extract_list, extract_tag, extract_tag_or_raw};
