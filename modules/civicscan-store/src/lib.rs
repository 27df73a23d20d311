pub mod pg;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use pg::PgResearchStore;
pub use traits::ResearchStore;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryStore;
