//! Tilestream - sampler feedback streaming for sparse textures

pub mod core;
pub mod residency;
pub mod debug;
