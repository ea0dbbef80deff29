//! Name-keyed staging buffer pool, one map per device class.
//!
//! Entries are created on the first call that stages a given tensor and
//! reused on every later call; capacity only grows, so after warm-up the
//! cache satisfies steady-state traffic without new allocations.  The cache
//! is owned by the executor and mutated only on its call thread; worker
//! threads see nothing but byte ranges handed out before job submission.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use stagehand_core::error::Result;
use stagehand_core::types::DeviceKind;
use stagehand_cuda::IoBuffer;

/// Which side of the engine a cache entry stages for.  Input and output
/// staging for the same tensor name never share a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferRole {
    Input,
    Output,
}

impl BufferRole {
    fn suffix(self) -> &'static str {
        match self {
            BufferRole::Input => "_inp",
            BufferRole::Output => "_out",
        }
    }
}

/// Process-held pool of staging buffers, keyed by tensor name and role.
pub struct BufferCache {
    host: HashMap<String, IoBuffer>,
    cuda: HashMap<String, IoBuffer>,
    /// Ordinal all device-resident entries are pinned to.
    device_id: i32,
}

impl BufferCache {
    pub fn new(device_id: i32) -> Self {
        Self {
            host: HashMap::new(),
            cuda: HashMap::new(),
            device_id,
        }
    }

    /// Fetch the staging buffer for `name`/`role` in the given device class,
    /// creating it on first use.
    pub fn buffer(
        &mut self,
        device: DeviceKind,
        name: &str,
        role: BufferRole,
    ) -> Result<&mut IoBuffer> {
        let key = format!("{name}{}", role.suffix());
        let map = match device {
            DeviceKind::Host => &mut self.host,
            DeviceKind::Cuda => &mut self.cuda,
        };
        match map.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(IoBuffer::new(device, self.device_id)?)),
        }
    }

    /// Number of entries held for one device class.
    pub fn len(&self, device: DeviceKind) -> usize {
        match device {
            DeviceKind::Host => self.host.len(),
            DeviceKind::Cuda => self.cuda.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty() && self.cuda.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_key_distinct_buffers() {
        let mut cache = BufferCache::new(0);
        {
            let inp = cache
                .buffer(DeviceKind::Host, "image", BufferRole::Input)
                .expect("host buffer");
            inp.reserve(32).expect("reserve input entry");
        }
        let out = cache
            .buffer(DeviceKind::Host, "image", BufferRole::Output)
            .expect("host buffer");
        assert_eq!(out.capacity(), 0, "output entry must be a fresh buffer");
        assert_eq!(cache.len(DeviceKind::Host), 2);
    }

    #[test]
    fn entries_are_reused_across_calls() {
        let mut cache = BufferCache::new(0);
        let first_ptr = {
            let buf = cache
                .buffer(DeviceKind::Host, "tokens", BufferRole::Input)
                .expect("host buffer");
            buf.reserve(128).expect("reserve");
            buf.allocate(128).expect("fill");
            buf.descr().ptr
        };
        let buf = cache
            .buffer(DeviceKind::Host, "tokens", BufferRole::Input)
            .expect("same entry");
        assert_eq!(buf.capacity(), 128);
        buf.clear();
        buf.reserve(64).expect("smaller reserve is a no-op");
        buf.allocate(64).expect("refill");
        assert_eq!(
            buf.descr().ptr,
            first_ptr,
            "non-growing reuse must not reallocate"
        );
        assert_eq!(cache.len(DeviceKind::Host), 1);
    }

    #[cfg(not(feature = "cuda-runtime"))]
    #[test]
    fn cuda_entries_require_the_runtime() {
        let mut cache = BufferCache::new(0);
        let err = cache
            .buffer(DeviceKind::Cuda, "image", BufferRole::Input)
            .expect_err("no cuda runtime in this build");
        assert!(matches!(
            err,
            stagehand_core::error::EngineError::RuntimeDisabled
        ));
        assert!(cache.is_empty());
    }
}
