//! Utils

pub mod hash;
