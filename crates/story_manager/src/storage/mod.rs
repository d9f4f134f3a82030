pub mod file_provider;
pub mod memory_provider;
pub mod provider;

pub use file_provider::FileStateStore;
pub use memory_provider::MemoryStateStore;
pub use provider::{load_typed, save_typed, Scope, StateStore};
