//! Storage layer for Uptrail.
//!
//! The engine talks to the [`Storage`] trait; [`Store`] persists to SQLite,
//! [`MemoryStore`] keeps everything in process.

mod memory;
mod models;
mod storage;
mod store;

pub use memory::*;
pub use models::*;
pub use storage::*;
pub use store::*;
