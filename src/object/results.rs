//! Ownership kernel result types
//!
//! Defines the lifecycle states and the outcome reported by `Object::destroy`.

/// Lifecycle state of a kernel object.
///
/// `DestroyRequested` is the deferred state: a destroy was asked for while
/// references were outstanding. `Destroying` is held for the whole duration
/// of the destructor and acts as the re-entrancy latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Live,
    DestroyRequested,
    Destroying,
    Destroyed,
}

/// Result of a destroy request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The object was already torn down (or is being torn down right now).
    AlreadyDone,
    /// References are outstanding; teardown runs on the last release.
    Deferred,
    /// The destructor ran during this call.
    Completed,
}
