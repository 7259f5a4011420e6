//! Collections
//!
//! Intrusive-style many-to-many membership containers backed by an arena
//! store, with cursors that survive deletion of the member they are about
//! to visit.

pub mod arena;
pub mod collectible;
pub mod container;
pub mod iterator;
pub mod store;

pub use collectible::Collectible;
pub use container::{Collection, Policy};
pub use iterator::Cursor;
pub use store::{Store, StoreStats};
