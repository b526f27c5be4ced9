// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types for connection attempts.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure of a connection attempt or transport call.
///
/// None of these escape the orchestrator: each one ends in a device status
/// change and, where the user should know about it, a notice.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serial link I/O failure: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("Bluetooth adapter is powered off")]
    AdapterOff,

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

impl LinkError {
    /// Whether the attempt must not be retried until the user grants access.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, LinkError::PermissionDenied(_))
    }
}

impl From<bluer::Error> for LinkError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::NotAuthorized
            | bluer::ErrorKind::NotPermitted
            | bluer::ErrorKind::AuthenticationRejected => {
                LinkError::PermissionDenied(err.message)
            }
            bluer::ErrorKind::NotReady => LinkError::AdapterOff,
            _ => LinkError::Bluetooth(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: LinkError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, LinkError::Io { .. }));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_permission_denied_flag() {
        assert!(LinkError::PermissionDenied("scan".into()).is_permission_denied());
        assert!(!LinkError::Timeout(Duration::from_secs(15)).is_permission_denied());
    }
}
