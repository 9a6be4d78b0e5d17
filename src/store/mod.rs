//! Persistence seam for descriptors and execution contexts.

pub mod memory;
pub mod traits;

pub use memory::InMemoryTaskStore;
pub use traits::TaskStore;
