//! Error handlers
//!
//! Provides error reporting and classification functions.

use crate::error::types::{ReactorError, RuntimeError, SecureError};
use log::{error, warn};
use std::io::ErrorKind;

/// Handle a runtime error
pub fn handle_error(err: &RuntimeError) {
    if is_transient(err) {
        warn!("Runtime warning: {}", err);
    } else {
        error!("Runtime error: {}", err);
    }
}

/// Whether the condition is worth retrying on a later tick
pub fn is_transient(err: &RuntimeError) -> bool {
    match err {
        RuntimeError::IoError(e) => is_transient_io(e.kind()),
        RuntimeError::Reactor(ReactorError::Io(e)) => is_transient_io(e.kind()),
        RuntimeError::Secure(SecureError::Io(e)) => is_transient_io(e.kind()),
        _ => false,
    }
}

fn is_transient_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectionError;
    use std::io;

    #[test]
    fn test_transient_classification() {
        let blocked = RuntimeError::IoError(io::Error::from(ErrorKind::WouldBlock));
        assert!(is_transient(&blocked));

        let refused = RuntimeError::Reactor(ReactorError::Io(io::Error::from(
            ErrorKind::ConnectionRefused,
        )));
        assert!(!is_transient(&refused));

        assert!(!is_transient(&RuntimeError::Collection(CollectionError::Void)));
    }
}
