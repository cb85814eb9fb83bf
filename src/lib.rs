pub mod fs;
pub mod fuse;

use std::path::Path;

use eyre::{Context, Result};
use fuser::MountOption;
use tracing::info;

use fs::storage::BlockStore;
use fs::{FileSystem, MountConfig};

#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("pagefs".to_owned()),
        MountOption::Subtype("pagefs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

/// A filesystem ready to be handed to FUSE.
#[derive(Debug)]
pub struct PageFs<Store: BlockStore> {
    fs: FileSystem<Store>,
}

impl<Store: BlockStore> PageFs<Store> {
    pub fn new(store: Store, config: MountConfig) -> Result<Self> {
        let fs = FileSystem::mount(store, config).wrap_err("Failed to set up the filesystem")?;
        Ok(Self { fs })
    }

    /// Serves requests at `mountpoint` until it is unmounted.
    /// Everything stored is gone once this returns.
    pub fn mount(self, mountpoint: &Path, options: &MountOptions) -> Result<()> {
        let fuse_opts = build_mount_options(options);
        info!("Mounting pagefs at {mountpoint:?}");
        fuser::mount2(self, mountpoint, &fuse_opts).wrap_err("FUSE session failed")?;
        Ok(())
    }
}

#[test]
fn test_mount_options() {
    let opts = build_mount_options(&MountOptions::default());
    assert_eq!(opts.len(), 4);
    let opts = build_mount_options(&MountOptions {
        allow_other: true,
        auto_unmount: true,
    });
    assert!(opts.contains(&MountOption::AllowOther));
    assert!(opts.contains(&MountOption::AutoUnmount));
}
