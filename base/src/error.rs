// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The error taxonomy shared by all crates of the workspace.
//!
//! Low-level components return the narrowest kind; the `PStates` layer
//! consumes `NotSupported` and `TryAnotherMechanism` to fall through to the
//! next access mechanism, everything else surfaces to the user.

use std::path::PathBuf;

use remain::sorted;
use thiserror::Error as ThisError;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// A min/max ordering constraint was violated (e.g. new minimum
    /// frequency above the currently configured maximum).
    #[error("{0}")]
    BadOrder(String),
    /// Malformed user input: unknown enumerated symbol, value that does not
    /// fit the declared bit width, bad format.
    #[error("{0}")]
    BadValue(String),
    /// An underlying I/O operation failed for a reason other than
    /// missing-file or permission.
    #[error("{0}")]
    Io(String),
    /// A file or directory does not exist.
    #[error("{0}")]
    NotFound(String),
    /// The feature or mechanism is missing on this platform, or disabled.
    #[error("{0}")]
    NotSupported(String),
    /// A numeric value is outside the platform limits.
    #[error("{0}")]
    OutOfRange(String),
    /// The kernel refused the operation, or a write was attempted through a
    /// read-only surface.
    #[error("{0}")]
    PermissionDenied(String),
    /// Internal signal: the current mechanism cannot serve the request, the
    /// caller should rotate to another one.
    #[error("{0}")]
    TryAnotherMechanism(String),
    /// A write-then-read-back returned a different value.
    #[error("{msg}")]
    VerifyFailed {
        msg: String,
        cpu: Option<u32>,
        expected: u64,
        actual: u64,
        path: Option<PathBuf>,
    },
}

impl Error {
    /// Rebuild the same error kind with a new message, preserving the
    /// structured payload. Used when a caller enriches an error with
    /// context before re-raising it.
    pub fn with_msg(self, msg: String) -> Error {
        match self {
            Error::BadOrder(_) => Error::BadOrder(msg),
            Error::BadValue(_) => Error::BadValue(msg),
            Error::Io(_) => Error::Io(msg),
            Error::NotFound(_) => Error::NotFound(msg),
            Error::NotSupported(_) => Error::NotSupported(msg),
            Error::OutOfRange(_) => Error::OutOfRange(msg),
            Error::PermissionDenied(_) => Error::PermissionDenied(msg),
            Error::TryAnotherMechanism(_) => Error::TryAnotherMechanism(msg),
            Error::VerifyFailed {
                cpu,
                expected,
                actual,
                path,
                ..
            } => Error::VerifyFailed {
                msg,
                cpu,
                expected,
                actual,
                path,
            },
        }
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_msg_preserves_verify_payload() {
        let err = Error::VerifyFailed {
            msg: "original".to_string(),
            cpu: Some(3),
            expected: 0x10,
            actual: 0x20,
            path: None,
        };
        match err.with_msg("enriched".to_string()) {
            Error::VerifyFailed {
                msg,
                cpu,
                expected,
                actual,
                ..
            } => {
                assert_eq!(msg, "enriched");
                assert_eq!(cpu, Some(3));
                assert_eq!(expected, 0x10);
                assert_eq!(actual, 0x20);
            }
            other => panic!("unexpected error kind: {other}"),
        }
    }
}
