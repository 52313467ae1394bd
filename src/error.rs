//! Error types for the array manager

use std::fmt;

use thiserror::Error;

use crate::device::DeviceId;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Reason a superblock was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuperblockFault {
    /// Magic number does not match
    BadMagic(u32),
    /// Version is not one we understand
    UnsupportedVersion { major: u32, minor: u32 },
    /// Stored checksum differs from the computed one
    BadChecksum { stored: u32, computed: u32 },
    /// raid_disks is zero or negative
    NoRaidDisks,
    /// Array UUID differs from the reference superblock
    UuidMismatch,
    /// Level, layout or chunk size differs from the reference superblock
    StructureMismatch,
    /// Feature bits we cannot honor
    UnsupportedFeatures(u32),
    /// Offsets or sizes that do not fit the device
    BadLayout(String),
}

impl fmt::Display for SuperblockFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuperblockFault::BadMagic(magic) => write!(f, "bad magic number {:#010x}", magic),
            SuperblockFault::UnsupportedVersion { major, minor } => {
                write!(f, "unsupported superblock version {}.{}", major, minor)
            }
            SuperblockFault::BadChecksum { stored, computed } => write!(
                f,
                "invalid superblock checksum {:#010x} (expected {:#010x})",
                stored, computed
            ),
            SuperblockFault::NoRaidDisks => write!(f, "superblock has no raid disks"),
            SuperblockFault::UuidMismatch => write!(f, "has different UUID"),
            SuperblockFault::StructureMismatch => write!(f, "has strangely different superblock"),
            SuperblockFault::UnsupportedFeatures(bits) => {
                write!(f, "unsupported feature bits {:#x}", bits)
            }
            SuperblockFault::BadLayout(reason) => write!(f, "{}", reason),
        }
    }
}

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{device}: I/O error: {source}")]
    DeviceIo {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{device}: {fault}")]
    Superblock {
        device: String,
        fault: SuperblockFault,
    },

    #[error("{array}: kicking non-fresh {device} from array (events {device_events}, array at {array_events})")]
    StaleDevice {
        array: String,
        device: String,
        device_events: u64,
        array_events: u64,
    },

    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    #[error("device {device} is busy (claimed by {holder})")]
    DeviceBusy { device: String, holder: String },

    #[error("{device}: too small ({have} sectors, need {need})")]
    DeviceTooSmall { device: String, have: u64, need: u64 },

    #[error("{0}: array is busy, try again")]
    ArrayBusy(String),

    #[error("{0}: interrupted")]
    Interrupted(String),

    #[error("{array}: {reason}")]
    InvalidState { array: String, reason: String },

    #[error("{0}: array is read-only")]
    ReadOnly(String),

    #[error("{array}: personality for level {level} is not registered")]
    NoPersonality { array: String, level: String },

    #[error("{array}: personality error: {reason}")]
    Personality { array: String, reason: String },

    #[error("{0}: event counter overflow")]
    EventOverflow(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an invalid-state error for an array
    pub fn state(array: &str, reason: impl Into<String>) -> Self {
        Error::InvalidState {
            array: array.to_string(),
            reason: reason.into(),
        }
    }

    /// Build a superblock error for a device
    pub fn superblock(device: &str, fault: SuperblockFault) -> Self {
        Error::Superblock {
            device: device.to_string(),
            fault,
        }
    }

    /// Concurrency errors the caller may simply retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ArrayBusy(_) | Error::Interrupted(_))
    }

    /// Metadata errors that exclude a device from an array
    pub fn is_metadata(&self) -> bool {
        matches!(self, Error::Superblock { .. } | Error::StaleDevice { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ArrayBusy("md0".into()).is_retryable());
        assert!(Error::Interrupted("md0".into()).is_retryable());
        assert!(!Error::EventOverflow("md0".into()).is_retryable());
        assert!(!Error::superblock("sda", SuperblockFault::UuidMismatch).is_retryable());
    }

    #[test]
    fn test_superblock_error_names_device() {
        let err = Error::superblock(
            "sdb1",
            SuperblockFault::BadChecksum {
                stored: 1,
                computed: 2,
            },
        );
        let msg = err.to_string();
        assert!(msg.starts_with("sdb1:"));
        assert!(msg.contains("checksum"));
        assert!(err.is_metadata());
    }
}
