//! Local filesystem helpers for preparing an application before staging.

pub mod copy;
pub mod tree_hash;

pub use copy::{copy_source_tree, is_hidden};
pub use tree_hash::digest_tree;
