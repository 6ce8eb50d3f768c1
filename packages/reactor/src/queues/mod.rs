//! Queue implementations.

pub mod memory;

pub use memory::MemoryQueue;
