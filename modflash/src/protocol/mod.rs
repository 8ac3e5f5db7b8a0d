//! Protocol implementations.

pub mod at;
pub mod frame;

// Re-export common types
pub use at::AtDriver;
pub use frame::{Command, CommandFrame};
