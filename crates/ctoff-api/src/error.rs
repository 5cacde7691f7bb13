// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::ct::CtStatus;
use serde::Deserialize;
use serde::Serialize;

/// Errors returned by the offload engine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error)]
pub enum OffloadError {
    /// The request cannot be expressed in hardware; the caller keeps
    /// the connection in software.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The cookie or tuple is already offloaded.
    #[error("duplicate entry")]
    Duplicate,

    #[error("{resource} exhausted (limit {limit})")]
    ResourceExhausted { resource: String, limit: u64 },

    #[error("not found")]
    NotFound,

    /// Hardware state and the tracker's view disagree.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("bad config: {0}")]
    BadConfig(String),
}

impl OffloadError {
    pub fn exhausted(resource: &str, limit: u64) -> Self {
        Self::ResourceExhausted { resource: resource.to_string(), limit }
    }

    /// The result code reported back to the tracker.
    pub fn status(&self) -> CtStatus {
        match self {
            Self::Duplicate => CtStatus::Duplicate,
            Self::NotFound => CtStatus::NotFound,
            Self::Unsupported(_) => CtStatus::Unsupported,
            Self::ResourceExhausted { .. }
            | Self::Inconsistent(_)
            | Self::Hardware(_)
            | Self::BadConfig(_) => CtStatus::Failed,
        }
    }

    /// Errors that are part of normal operation and not worth logging.
    pub fn is_quiet(&self) -> bool {
        matches!(self, Self::Duplicate | Self::NotFound)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(OffloadError::Duplicate.status(), CtStatus::Duplicate);
        assert_eq!(OffloadError::NotFound.status(), CtStatus::NotFound);
        assert_eq!(
            OffloadError::Unsupported("x".into()).status(),
            CtStatus::Unsupported
        );
        assert_eq!(
            OffloadError::exhausted("zone ids", 255).status(),
            CtStatus::Failed
        );
        assert!(OffloadError::Duplicate.is_quiet());
        assert!(!OffloadError::Hardware("busy".into()).is_quiet());
    }

    #[test]
    fn display() {
        assert_eq!(
            OffloadError::exhausted("counters", 4).to_string(),
            "counters exhausted (limit 4)"
        );
    }
}
