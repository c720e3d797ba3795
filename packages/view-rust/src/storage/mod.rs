//! Storage backends federated by a view.
//!
//! Provides the session contracts the view consumes and one reference
//! implementation:
//!
//! - [`Storage`]: opens read and write sessions
//! - [`ReadSession`]: executes reads, carries fetch size and timeouts
//! - [`WriteSession`]: transactional writes, commit/rollback and locks
//! - [`MemoryStorage`]: in-memory backend over `DashMap`

pub mod memory;
pub mod session;

pub use memory::{MemoryReadSession, MemoryStorage, MemoryWriteSession};
pub use session::{ReadSession, Storage, WriteSession};
