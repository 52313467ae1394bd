//! Automatic assembly of v0.90 arrays
//!
//! Every candidate device is imported with a 0.90 superblock. Devices
//! are grouped by array UUID and each group is started at the minor
//! recorded in its superblocks.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Array, ArrayMeta, ArrayRegistry, StopMode};
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::rdev::Rdev;
use crate::superblock::MetadataFormat;

/// Holder name used while devices wait to be sorted into arrays
const AUTORUN_HOLDER: &str = "autorun";

/// Outcome for one group of devices
#[derive(Debug, Clone, Serialize)]
pub struct AutorunReport {
    pub array: String,
    pub uuid: Uuid,
    pub devices: Vec<String>,
    /// Why the array was not started
    pub error: Option<String>,
}

impl AutorunReport {
    pub fn started(&self) -> bool {
        self.error.is_none()
    }
}

/// Assemble and start every v0.90 array found on `ids`
pub async fn autorun(registry: &Arc<ArrayRegistry>, ids: &[DeviceId]) -> Vec<AutorunReport> {
    let mut pending = Vec::new();
    for id in ids {
        match Rdev::import(registry.devices(), *id, AUTORUN_HOLDER, Some(MetadataFormat::V090)) {
            Ok(rdev) if rdev.is_faulty() => {
                warn!("md: {} has invalid sb, not importing!", rdev.name());
            }
            Ok(rdev) => pending.push(rdev),
            Err(e) => warn!("md: could not import {}: {}", id, e),
        }
    }

    info!("md: autorun ...");
    let mut reports = Vec::new();
    while !pending.is_empty() {
        let first = pending.remove(0);
        let uuid = first.superblock().map(|sb| sb.uuid()).unwrap_or_default();
        let unit = first.preferred_minor.unwrap_or(0);
        info!("md: considering {} ...", first.name());

        let (mut set, rest): (Vec<Rdev>, Vec<Rdev>) = pending
            .into_iter()
            .partition(|rdev| rdev.superblock().map(|sb| sb.uuid()) == Some(uuid));
        pending = rest;
        set.insert(0, first);
        for rdev in &set {
            info!("md:  adding {} ...", rdev.name());
        }

        let devices = set.iter().map(|r| r.name().to_string()).collect();
        let handle = registry.open(unit);
        let result = match bind_set(&handle, set).await {
            Ok(()) => match handle.run().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    if let Err(stop) = handle.stop(StopMode::Full).await {
                        warn!("md: {}: cleanup failed: {}", handle.name(), stop);
                    }
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!("md: {}: autorun failed: {}", handle.name(), e);
        }

        reports.push(AutorunReport {
            array: handle.name().to_string(),
            uuid,
            devices,
            error: result.err().map(|e| e.to_string()),
        });
    }
    info!("md: ... autorun DONE.");
    reports
}

/// Bind a group to an empty array; the group is exported on failure
async fn bind_set(array: &Array, set: Vec<Rdev>) -> Result<()> {
    let _guard = array.lock().await;
    let mut inner = array.inner.lock();
    if !inner.members.is_empty() || inner.personality.is_some() {
        return Err(Error::state(
            array.name(),
            "already has members, cannot run the group here",
        ));
    }
    let mut meta = ArrayMeta::new(MetadataFormat::V090);
    meta.preferred_minor = array.unit();
    inner.meta = meta;
    for rdev in set {
        if let Err(e) = array.bind_locked(&mut inner, rdev) {
            inner.members.clear();
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayGeometry, ArrayState, DiskSpec};
    use crate::personality::Level;
    use crate::testutil::{mem_table, registry};

    fn id(minor: u32) -> DeviceId {
        DeviceId::new(8, minor)
    }

    async fn make_array(registry: &Arc<ArrayRegistry>, unit: u32, minors: &[u32]) {
        let handle = registry.open(unit);
        let mut geometry = ArrayGeometry::new(Level::Raid1, minors.len() as u32);
        geometry.format = Some(MetadataFormat::V090);
        geometry.clean = true;
        handle.create(geometry).await.unwrap();
        for (slot, minor) in minors.iter().enumerate() {
            handle.add_device(DiskSpec::new(id(*minor)).slot(slot as u32)).await.unwrap();
        }
        handle.run().await.unwrap();
        handle.stop(StopMode::Full).await.unwrap();
    }

    #[tokio::test]
    async fn test_autorun_groups_by_uuid() {
        let registry = registry(mem_table(&[0, 16, 32, 48, 64], 4096));
        make_array(&registry, 2, &[0, 32]).await;
        make_array(&registry, 5, &[16, 48]).await;

        let ids: Vec<_> = [0, 16, 32, 48, 64].iter().map(|m| id(*m)).collect();
        let reports = autorun(&registry, &ids).await;

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(AutorunReport::started));
        assert_eq!(reports[0].array, "md2");
        assert_eq!(reports[0].devices, vec!["sda", "sdc"]);
        assert_eq!(reports[1].array, "md5");

        assert_eq!(registry.get(2).unwrap().state(), ArrayState::Running);
        assert_eq!(registry.devices().holder(id(16)).as_deref(), Some("md5"));
        // blank device was never kept
        assert!(registry.devices().holder(id(64)).is_none());
    }

    #[tokio::test]
    async fn test_autorun_skips_occupied_unit() {
        let registry = registry(mem_table(&[0, 16, 32], 4096));
        make_array(&registry, 0, &[0, 16]).await;

        let squatter = registry.open(0);
        squatter.add_device(DiskSpec::new(id(32))).await.unwrap_err();
        {
            let mut inner = squatter.inner.lock();
            let rdev = Rdev::import(registry.devices(), id(32), "md0", None).unwrap();
            squatter.bind_locked(&mut inner, rdev).unwrap();
        }

        let reports = autorun(&registry, &[id(0), id(16)]).await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].started());
        assert!(registry.devices().holder(id(0)).is_none());
        assert_eq!(squatter.member_count(), 1);
    }
}
