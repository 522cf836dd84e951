//! Common utilities shared by the modules of the crate

pub mod profiler;
pub mod types;
pub mod utils;
pub mod uuid;
