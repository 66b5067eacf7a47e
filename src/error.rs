//! Failure classes shared across the catalog, the streaming pipelines and
//! the command executor.

use std::fmt;

/// Catalog entity kinds, used in not-found / already-exists reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Archive,
    Connection,
    Profile,
    Basebackup,
    Tablespace,
    RetentionPolicy,
    Worker,
    Variable,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Entity::Archive => "archive",
            Entity::Connection => "connection",
            Entity::Profile => "backup profile",
            Entity::Basebackup => "basebackup",
            Entity::Tablespace => "tablespace",
            Entity::RetentionPolicy => "retention policy",
            Entity::Worker => "worker",
            Entity::Variable => "variable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("no catalog attached")]
    CatalogUnavailable,

    #[error("{entity} \"{ident}\" does not exist")]
    NotFound { entity: Entity, ident: String },

    #[error("{entity} \"{ident}\" already exists")]
    AlreadyExists { entity: Entity, ident: String },

    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("protocol error during {phase}: {reason}")]
    Protocol { phase: String, reason: String },

    #[error("I/O error: {reason}")]
    Io {
        reason: String,
        os_code: Option<i32>,
    },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("server connection error: {0}")]
    Upstream(#[from] tokio_postgres::Error),
}

impl ArchiveError {
    pub fn not_found(entity: Entity, ident: impl Into<String>) -> Self {
        ArchiveError::NotFound {
            entity,
            ident: ident.into(),
        }
    }

    pub fn already_exists(entity: Entity, ident: impl Into<String>) -> Self {
        ArchiveError::AlreadyExists {
            entity,
            ident: ident.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ArchiveError::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(phase: impl Into<String>, reason: impl Into<String>) -> Self {
        ArchiveError::Protocol {
            phase: phase.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        ArchiveError::Io {
            reason: e.to_string(),
            os_code: e.raw_os_error(),
        }
    }
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
