//! Utility Module
//!
//! Shared helpers that do not belong to a single protocol layer. Currently
//! this is the wire-coded enum generator used for BVLL result codes.

pub mod enum_macros;
