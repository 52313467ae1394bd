//! RAID level personalities
//!
//! The array core never touches data layout itself. Everything that
//! depends on the RAID level goes through the [`Personality`] trait; an
//! implementation is looked up by [`Level`] in the
//! [`PersonalityRegistry`] when an array is started.

pub mod raid1;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::rdev::MemberInfo;
use crate::resync::SyncKind;

pub use raid1::Raid1Factory;

/// RAID level as stored in superblocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Multipath,
    Linear,
    Raid0,
    Raid1,
    Raid4,
    Raid5,
    Raid6,
    Raid10,
}

impl Level {
    /// Decode the on-disk level number
    pub fn from_raw(raw: i32) -> Option<Level> {
        match raw {
            -4 => Some(Level::Multipath),
            -1 => Some(Level::Linear),
            0 => Some(Level::Raid0),
            1 => Some(Level::Raid1),
            4 => Some(Level::Raid4),
            5 => Some(Level::Raid5),
            6 => Some(Level::Raid6),
            10 => Some(Level::Raid10),
            _ => None,
        }
    }

    /// On-disk level number
    pub fn raw(self) -> i32 {
        match self {
            Level::Multipath => -4,
            Level::Linear => -1,
            Level::Raid0 => 0,
            Level::Raid1 => 1,
            Level::Raid4 => 4,
            Level::Raid5 => 5,
            Level::Raid6 => 6,
            Level::Raid10 => 10,
        }
    }

    /// Striped levels cannot run without a chunk size
    pub fn requires_chunk(self) -> bool {
        matches!(
            self,
            Level::Raid0 | Level::Raid4 | Level::Raid5 | Level::Raid6 | Level::Raid10
        )
    }

    /// Name used in status output
    pub fn name(self) -> &'static str {
        match self {
            Level::Multipath => "multipath",
            Level::Linear => "linear",
            Level::Raid0 => "raid0",
            Level::Raid1 => "raid1",
            Level::Raid4 => "raid4",
            Level::Raid5 => "raid5",
            Level::Raid6 => "raid6",
            Level::Raid10 => "raid10",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "multipath" | "mp" => Level::Multipath,
            "linear" => Level::Linear,
            "0" | "raid0" | "stripe" => Level::Raid0,
            "1" | "raid1" | "mirror" => Level::Raid1,
            "4" | "raid4" => Level::Raid4,
            "5" | "raid5" => Level::Raid5,
            "6" | "raid6" => Level::Raid6,
            "10" | "raid10" => Level::Raid10,
            other => return Err(Error::InvalidConfig(format!("unknown raid level '{}'", other))),
        };
        Ok(level)
    }
}

/// What a personality gets to see of an array
///
/// This is a snapshot taken by the core. Personalities report changes
/// through return values, never by reaching back into the array.
#[derive(Debug, Clone)]
pub struct ArrayContext {
    /// Array name, e.g. `md0`
    pub name: String,
    /// RAID level
    pub level: Level,
    /// Layout code
    pub layout: u32,
    /// Chunk size in sectors
    pub chunk_sectors: u32,
    /// Number of raid slots
    pub raid_disks: u32,
    /// Used size of each member in sectors
    pub dev_sectors: u64,
    /// Members at the time of the snapshot
    pub members: Vec<MemberInfo>,
    /// Pass being run, for contexts handed to `sync_request`
    pub sync_kind: Option<SyncKind>,
}

impl ArrayContext {
    /// Member currently occupying a raid slot
    pub fn member_in_slot(&self, slot: u32) -> Option<&MemberInfo> {
        self.members
            .iter()
            .find(|m| m.raid_disk == Some(slot) && !m.faulty)
    }

    /// Members that are in sync and not faulty
    pub fn working_members(&self) -> impl Iterator<Item = &MemberInfo> {
        self.members
            .iter()
            .filter(|m| m.raid_disk.is_some() && m.in_sync && !m.faulty)
    }

    /// Number of raid slots without a working member
    pub fn degraded(&self) -> u32 {
        self.raid_disks
            .saturating_sub(self.working_members().count() as u32)
    }
}

/// A RAID level implementation attached to one running array
pub trait Personality: Send + Sync {
    /// Personality name, e.g. `raid1`
    fn name(&self) -> &'static str;

    /// Start serving the array
    fn run(&self, array: &ArrayContext) -> Result<()>;

    /// Stop serving the array
    fn stop(&self, array: &ArrayContext);

    /// Advance a resync/recovery at `position`
    ///
    /// Returns the number of sectors handled, or a negative value on
    /// failure. `slow` hints that the pass is below its minimum speed.
    fn sync_request(&self, array: &ArrayContext, position: u64, slow: bool) -> i64;

    /// Whether `sync_request` does anything useful
    fn supports_resync(&self) -> bool {
        true
    }

    /// Whether members can be hot-added and hot-removed
    fn supports_hot_disks(&self) -> bool {
        true
    }

    /// A member failed
    fn error_handler(&self, array: &ArrayContext, member: &MemberInfo);

    /// Offer a spare; returns the raid slot it will be recovered into
    fn hot_add_disk(&self, array: &ArrayContext, member: &MemberInfo) -> Option<u32>;

    /// Release a raid slot
    fn hot_remove_disk(&self, array: &ArrayContext, slot: u32) -> Result<()>;

    /// Recovery finished; returns the slots whose members are now in sync
    fn spare_active(&self, array: &ArrayContext) -> Vec<u32>;

    /// Change the used size of each member
    fn resize(&self, array: &ArrayContext, _new_sectors: u64) -> Result<()> {
        Err(Error::Personality {
            array: array.name.clone(),
            reason: format!("{} does not support resizing", self.name()),
        })
    }

    /// Change the number of raid slots
    fn reshape(&self, array: &ArrayContext, _new_raid_disks: u32) -> Result<()> {
        Err(Error::Personality {
            array: array.name.clone(),
            reason: format!("{} does not support reshaping", self.name()),
        })
    }

    /// Append level specific status to an mdstat line
    fn status(&self, out: &mut dyn fmt::Write, array: &ArrayContext) -> fmt::Result;
}

/// Creates a personality instance for each array started at its level
pub trait PersonalityFactory: Send + Sync {
    /// Level served
    fn level(&self) -> Level;

    /// Personality name
    fn name(&self) -> &'static str;

    /// New instance for one array
    fn create(&self) -> Arc<dyn Personality>;
}

/// Registered personalities, by level
#[derive(Default)]
pub struct PersonalityRegistry {
    factories: RwLock<HashMap<Level, Arc<dyn PersonalityFactory>>>,
}

impl PersonalityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a personality, replacing any previous one for its level
    pub fn register(&self, factory: Arc<dyn PersonalityFactory>) {
        info!("md: {} personality registered for level {}", factory.name(), factory.level().raw());
        self.factories.write().insert(factory.level(), factory);
    }

    /// Remove the personality for a level
    pub fn unregister(&self, level: Level) -> bool {
        let removed = self.factories.write().remove(&level);
        if let Some(factory) = &removed {
            info!("md: {} personality unregistered", factory.name());
        }
        removed.is_some()
    }

    /// Find the personality for a level
    pub fn find(&self, level: Level) -> Option<Arc<dyn PersonalityFactory>> {
        self.factories.read().get(&level).cloned()
    }

    /// Names of registered personalities, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.read().values().map(|f| f.name()).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_raw_roundtrip() {
        for level in [
            Level::Multipath,
            Level::Linear,
            Level::Raid0,
            Level::Raid1,
            Level::Raid4,
            Level::Raid5,
            Level::Raid6,
            Level::Raid10,
        ] {
            assert_eq!(Level::from_raw(level.raw()), Some(level));
        }
        assert_eq!(Level::from_raw(3), None);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("raid5".parse::<Level>().unwrap(), Level::Raid5);
        assert_eq!("1".parse::<Level>().unwrap(), Level::Raid1);
        assert_eq!("Mirror".parse::<Level>().unwrap(), Level::Raid1);
        assert!("raid7".parse::<Level>().is_err());
    }

    #[test]
    fn test_requires_chunk() {
        assert!(Level::Raid5.requires_chunk());
        assert!(!Level::Raid1.requires_chunk());
        assert!(!Level::Linear.requires_chunk());
    }

    #[test]
    fn test_registry_find_and_unregister() {
        let registry = PersonalityRegistry::new();
        registry.register(Arc::new(Raid1Factory));

        assert!(registry.find(Level::Raid1).is_some());
        assert!(registry.find(Level::Raid5).is_none());
        assert_eq!(registry.names(), vec!["raid1"]);

        assert!(registry.unregister(Level::Raid1));
        assert!(!registry.unregister(Level::Raid1));
    }
}
