pub mod memory;
pub mod sql;

pub use memory::{MemoryAdapter, MemoryAdapterFactory};
pub use sql::check_syntax;
