//! Integration test package for the upkeep workspace.
//!
//! The actual tests live in `tests/`; this crate exists only to anchor
//! them at the workspace root.
