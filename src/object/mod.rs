//! Ownership kernel
//!
//! Reference-counted lifecycle headers shared by every runtime record that
//! needs deferred teardown (collections, collectibles, monitors).

pub mod lifecycle;
pub mod results;

pub use lifecycle::{Object, ObjectGuard};
pub use results::{DestroyOutcome, Lifecycle};
