//! Format and mount options.

use serde::{Deserialize, Serialize};
use ufs_alloc::AllocPolicy;
use ufs_error::{Result, UfsError};
use ufs_ondisk::{Geometry, GeometryParams};
use ufs_types::ByteOrder;

/// Layout of a filesystem to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Block size in bytes.
    pub bsize: u32,
    /// Fragment size in bytes.
    pub fsize: u32,
    /// Blocks per cylinder group.
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    /// Number of cylinder groups. `None` fits as many whole groups as the
    /// device holds.
    pub ncg: Option<u32>,
    /// Filesystem size in fragments; `None` means every group is full size.
    pub size: Option<u64>,
    pub byte_order: ByteOrder,
    /// Allocation tunables recorded in the superblock.
    pub policy: AllocPolicy,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            bsize: 4096,
            fsize: 512,
            blocks_per_group: 1024,
            inodes_per_group: 256,
            ncg: None,
            size: None,
            byte_order: ByteOrder::Little,
            policy: AllocPolicy::default(),
        }
    }
}

impl FormatOptions {
    /// Derive and validate the geometry for a device of `frag_count`
    /// fragments of `frag_size` bytes.
    pub fn geometry(&self, frag_size: u32, frag_count: u64) -> Result<Geometry> {
        if frag_size != self.fsize {
            return Err(UfsError::InvalidGeometry(format!(
                "device fragment size {frag_size} differs from fsize {}",
                self.fsize
            )));
        }
        let frag = self.bsize.checked_div(self.fsize).unwrap_or(0);
        let fpg = self
            .blocks_per_group
            .checked_mul(frag)
            .ok_or_else(|| UfsError::InvalidGeometry("blocks_per_group too large".to_owned()))?;
        if fpg == 0 {
            return Err(UfsError::InvalidGeometry("empty cylinder group".to_owned()));
        }
        let ncg = match self.ncg {
            Some(ncg) => ncg,
            None => u32::try_from(frag_count / u64::from(fpg))
                .map_err(|_| UfsError::InvalidGeometry("too many cylinder groups".to_owned()))?,
        };
        let size = self.size.unwrap_or(u64::from(ncg) * u64::from(fpg));
        if size > frag_count {
            return Err(UfsError::InvalidGeometry(format!(
                "filesystem of {size} fragments does not fit a {frag_count} fragment device"
            )));
        }
        Geometry::new(GeometryParams {
            bsize: self.bsize,
            fsize: self.fsize,
            fpg,
            ipg: self.inodes_per_group,
            ncg,
            size,
            order: self.byte_order,
        })
    }
}

/// How to attach to an existing filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Refuse every mutation with [`UfsError::ReadOnly`].
    pub read_only: bool,
    /// Overrides the policy recorded in the superblock.
    pub policy: Option<AllocPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_default_to_what_the_device_holds() {
        let opts = FormatOptions {
            blocks_per_group: 100,
            inodes_per_group: 32,
            ..FormatOptions::default()
        };
        let geo = opts.geometry(512, 4 * 800 + 17).expect("geometry");
        assert_eq!(geo.ncg, 4);
        assert_eq!(geo.fpg, 800);
        assert_eq!(geo.size, 3200);
    }

    #[test]
    fn mismatched_or_oversized_layouts_are_rejected() {
        let opts = FormatOptions {
            blocks_per_group: 100,
            inodes_per_group: 32,
            ncg: Some(8),
            ..FormatOptions::default()
        };
        assert!(matches!(opts.geometry(512, 3200), Err(UfsError::InvalidGeometry(_))));
        assert!(matches!(opts.geometry(1024, 1 << 20), Err(UfsError::InvalidGeometry(_))));

        let bad_ipg = FormatOptions {
            inodes_per_group: 20,
            ..FormatOptions::default()
        };
        assert!(bad_ipg.geometry(512, 1 << 20).is_err());
    }
}
