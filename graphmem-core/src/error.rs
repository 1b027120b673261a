// Copyright 2025 Graphmem (https://github.com/graphmem)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error model shared across the service.
//!
//! Every error carries a machine-readable kind (stable string surfaced to
//! clients) and a human-readable message. Dependency failures name the
//! dependency that failed.

use thiserror::Error;

/// Service-wide error type.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{dependency}: {message}")]
    Dependency {
        dependency: &'static str,
        message: String,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl MemoryError {
    /// Stable machine-readable kind, surfaced to clients alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::NotFound(_) => "not_found",
            MemoryError::AlreadyExists(_) => "already_exists",
            MemoryError::InvalidArgument(_) => "invalid_argument",
            MemoryError::Unauthorized(_) => "unauthorized",
            MemoryError::Forbidden(_) => "forbidden",
            MemoryError::QuotaExceeded(_) => "quota_exceeded",
            MemoryError::Dependency { .. } => "dependency_failure",
            MemoryError::Conflict(_) => "conflict",
            MemoryError::Internal(_) => "internal",
        }
    }

    /// Name of the failed dependency, if this is a dependency failure.
    pub fn dependency_name(&self) -> Option<&'static str> {
        match self {
            MemoryError::Dependency { dependency, .. } => Some(dependency),
            _ => None,
        }
    }

    /// Wrap an I/O-boundary error with its origin component.
    pub fn dependency(dependency: &'static str, err: impl std::fmt::Display) -> Self {
        MemoryError::Dependency {
            dependency,
            message: err.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        MemoryError::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        MemoryError::InvalidArgument(message.into())
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(MemoryError::not_found("x").kind(), "not_found");
        assert_eq!(
            MemoryError::dependency("graph-store", "boom").kind(),
            "dependency_failure"
        );
        assert_eq!(MemoryError::QuotaExceeded("too big".into()).kind(), "quota_exceeded");
    }

    #[test]
    fn dependency_carries_origin() {
        let err = MemoryError::dependency("vector-store", "connection refused");
        assert_eq!(err.dependency_name(), Some("vector-store"));
        assert_eq!(err.to_string(), "vector-store: connection refused");
        assert_eq!(MemoryError::Conflict("busy".into()).dependency_name(), None);
    }
}
