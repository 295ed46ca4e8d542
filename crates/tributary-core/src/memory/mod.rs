//! In-memory implementations of the boundary traits.
//!
//! Used by single-process deployments without Redis and by the test suites
//! of every crate in the workspace.

mod items;
mod queue;
mod sources;
mod store;

pub use items::MemoryItemRepository;
pub use queue::MemoryTaskQueue;
pub use sources::MemorySourceRepository;
pub use store::MemoryStore;
