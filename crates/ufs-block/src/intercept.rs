//! Write-intercepting device wrapper.
//!
//! The hook slot is empty while the filesystem has no snapshots; writes then
//! pass straight through. Callers that must bypass the hook (metadata whose
//! pre-image no snapshot needs) write to [`InterceptDevice::base`] directly.

use crate::{BlockBuf, BlockDevice, BufferLocks, IoStats, WriteMode};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;
use ufs_error::Result;
use ufs_types::FragNumber;

/// Runs before a live write lands on the device.
pub trait WriteIntercept: Send + Sync {
    /// Called with the target address and length; the write is abandoned
    /// if this returns an error.
    fn before_write(&self, addr: FragNumber, len: usize) -> Result<()>;
}

/// Device wrapper that gives an installed [`WriteIntercept`] a chance to act
/// before each write.
pub struct InterceptDevice<D: BlockDevice + ?Sized> {
    base: Arc<D>,
    hook: RwLock<Option<Arc<dyn WriteIntercept>>>,
}

impl<D: BlockDevice + ?Sized> std::fmt::Debug for InterceptDevice<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptDevice")
            .field("hooked", &self.is_hooked())
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice + ?Sized> InterceptDevice<D> {
    pub fn new(base: Arc<D>) -> Self {
        Self {
            base,
            hook: RwLock::new(None),
        }
    }

    /// The device underneath, for writes that must not be intercepted.
    #[must_use]
    pub fn base(&self) -> &Arc<D> {
        &self.base
    }

    /// Install `hook`, replacing any previous one.
    pub fn set_hook(&self, hook: Arc<dyn WriteIntercept>) {
        *self.hook.write() = Some(hook);
        debug!("write intercept installed");
    }

    /// Remove the hook; returns whether one was installed.
    pub fn clear_hook(&self) -> bool {
        let had = self.hook.write().take().is_some();
        if had {
            debug!("write intercept removed");
        }
        had
    }

    #[must_use]
    pub fn is_hooked(&self) -> bool {
        self.hook.read().is_some()
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for InterceptDevice<D> {
    fn read(&self, addr: FragNumber, len: usize) -> Result<BlockBuf> {
        self.base.read(addr, len)
    }

    fn write(&self, addr: FragNumber, data: &[u8], mode: WriteMode) -> Result<()> {
        // Clone out of the slot so the hook runs without the slot lock held.
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook.before_write(addr, data.len())?;
        }
        self.base.write(addr, data, mode)
    }

    fn frag_size(&self) -> u32 {
        self.base.frag_size()
    }

    fn frag_count(&self) -> u64 {
        self.base.frag_count()
    }

    fn sync(&self) -> Result<()> {
        self.base.sync()
    }

    fn buffer_locks(&self) -> &BufferLocks {
        self.base.buffer_locks()
    }

    fn stats(&self) -> IoStats {
        self.base.stats()
    }
}
