//! mdraid - Software RAID array management
//!
//! This library implements the control plane of a multiple-device
//! driver: on-disk superblocks, member devices, array assembly and
//! lifecycle, pluggable RAID level personalities, and the background
//! resync and recovery engine that keeps redundancy consistent.

pub mod array;
pub mod config;
pub mod device;
pub mod error;
pub mod personality;
pub mod rdev;
pub mod resync;
pub mod superblock;
pub mod supervisor;

#[cfg(test)]
mod testutil;

pub use array::{Array, ArrayHandle, ArrayRegistry};
pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::array::{
        ArrayGeometry, ArrayHandle, ArrayInfo, ArrayRegistry, DiskSpec, StopMode, SyncAction,
    };
    pub use crate::config::Config;
    pub use crate::device::{BlockDevice, DeviceId, DeviceTable};
    pub use crate::error::{Error, Result};
    pub use crate::personality::Level;
    pub use crate::superblock::MetadataFormat;
}
