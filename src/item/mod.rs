/// In-memory item reader and writer, restartable through the execution context.
pub mod list;

#[cfg(feature = "logger")]
/// This module provides a logger item writer, useful for debugging purposes.
pub mod logger;
