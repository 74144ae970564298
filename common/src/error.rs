use std::fmt;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Device,
    Program,
    Schedule,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Program => "program",
            Self::Schedule => "schedule",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure the core can report back through a reply slot.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: EntityKind, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: EntityKind, name: String },

    #[error("element index {index} out of range (program has {len} elements)")]
    OutOfRange { index: usize, len: usize },

    #[error("device '{device}' is in use by program '{program}'")]
    DeviceInUse { device: String, program: String },

    #[error("program '{program}' is in use by schedule '{schedule}'")]
    ProgramInUse { program: String, schedule: String },

    #[error("invalid schedule spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("state i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("{owner} refers to unknown {target}")]
    DanglingReference { owner: String, target: String },

    #[error("dispatcher has shut down")]
    DispatcherClosed,
}

impl Error {
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }
}
