//! Reusable device-resident staging buffer.
//!
//! # Reuse contract
//!
//! `clear()` → `reserve(total)` → a series of `allocate(n)` calls.
//! Reservation is separated from allocation so the call thread can size the
//! buffer once and hand disjoint sub-ranges to copy workers without locks or
//! reallocation races: growing a partially-filled buffer would invalidate
//! pointers already handed out, so `reserve` refuses to grow unless the fill
//! cursor is at zero.
//!
//! Capacity never shrinks.  `clear()` only resets the fill cursor, which is
//! the reuse optimization: after warm-up a cache entry satisfies every call
//! without touching the allocator.

use stagehand_core::error::{EngineError, Result};
use stagehand_core::types::{DeviceKind, InputFragment, OutputFragment};
use tracing::debug;

enum Storage {
    Host(Vec<u8>),
    #[cfg(feature = "cuda-runtime")]
    Cuda {
        device: std::sync::Arc<cudarc::driver::CudaDevice>,
        /// Lazily allocated on the first non-zero `reserve`.
        slice: Option<cudarc::driver::CudaSlice<u8>>,
    },
}

/// An owned, resizable, append-only byte region on one device.
pub struct IoBuffer {
    storage: Storage,
    device: DeviceKind,
    device_id: i32,
    filled: usize,
}

// Manual impl: the device storage handle has no useful `Debug` of its own.
impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("device", &self.device)
            .field("device_id", &self.device_id)
            .field("filled", &self.filled)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl IoBuffer {
    /// Create an empty buffer on the given placement.
    ///
    /// Device-resident buffers require the `cuda-runtime` feature; without
    /// it this returns [`EngineError::RuntimeDisabled`].
    pub fn new(device: DeviceKind, device_id: i32) -> Result<Self> {
        let storage = match device {
            DeviceKind::Host => Storage::Host(Vec::new()),
            #[cfg(feature = "cuda-runtime")]
            DeviceKind::Cuda => Storage::Cuda {
                device: cudarc::driver::CudaDevice::new(device_id as usize)?,
                slice: None,
            },
            #[cfg(not(feature = "cuda-runtime"))]
            DeviceKind::Cuda => return Err(EngineError::RuntimeDisabled),
        };
        Ok(Self {
            storage,
            device,
            device_id: if device.is_host() { 0 } else { device_id },
            filled: 0,
        })
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Reserved capacity in bytes.
    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Host(v) => v.len(),
            #[cfg(feature = "cuda-runtime")]
            Storage::Cuda { slice, .. } => {
                use cudarc::driver::DeviceSlice;
                slice.as_ref().map(|s| s.len()).unwrap_or(0)
            }
        }
    }

    /// Bytes handed out since the last `clear`.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Grow capacity to at least `size` bytes.  A no-op when capacity
    /// already suffices.  Fails with [`EngineError::ReserveWhileFilled`]
    /// when growth is needed but the buffer holds filled bytes.
    pub fn reserve(&mut self, size: usize) -> Result<()> {
        if size <= self.capacity() {
            return Ok(());
        }
        if self.filled != 0 {
            return Err(EngineError::ReserveWhileFilled {
                requested: size,
                filled: self.filled,
            });
        }
        debug!(
            device = ?self.device,
            from = self.capacity(),
            to = size,
            "growing staging buffer"
        );
        match &mut self.storage {
            Storage::Host(v) => v.resize(size, 0),
            #[cfg(feature = "cuda-runtime")]
            Storage::Cuda { device, slice } => {
                // The old allocation is dropped without a content copy; the
                // grow path only runs with an empty fill cursor.
                *slice = Some(device.alloc_zeros::<u8>(size)?);
            }
        }
        Ok(())
    }

    /// Bump-allocate `size` bytes from the unfilled tail.
    ///
    /// The returned pointer stays valid until the next `clear` or `reserve`.
    pub fn allocate(&mut self, size: usize) -> Result<*mut u8> {
        let need = self.filled + size;
        if need > self.capacity() {
            return Err(EngineError::BufferTooSmall {
                need,
                have: self.capacity(),
            });
        }
        // SAFETY: `filled + size <= capacity`, so the offset stays inside
        // the owned region.
        let ptr = unsafe { self.base_mut_ptr().add(self.filled) };
        self.filled = need;
        Ok(ptr)
    }

    /// Reset the fill cursor.  Capacity and storage are untouched.
    pub fn clear(&mut self) {
        self.filled = 0;
    }

    /// Read-only fragment covering `[0, filled)`.
    pub fn descr(&self) -> InputFragment {
        InputFragment {
            ptr: self.base_ptr(),
            size: self.filled,
            device: self.device,
            device_id: self.device_id,
        }
    }

    /// Writable fragment covering `[0, filled)`.
    pub fn descr_mut(&mut self) -> OutputFragment {
        OutputFragment {
            ptr: self.base_mut_ptr(),
            size: self.filled,
            device: self.device,
            device_id: self.device_id,
        }
    }

    fn base_ptr(&self) -> *const u8 {
        match &self.storage {
            Storage::Host(v) => v.as_ptr(),
            #[cfg(feature = "cuda-runtime")]
            Storage::Cuda { slice, .. } => {
                use cudarc::driver::DevicePtr;
                slice
                    .as_ref()
                    .map(|s| *s.device_ptr() as *const u8)
                    .unwrap_or(std::ptr::null())
            }
        }
    }

    fn base_mut_ptr(&mut self) -> *mut u8 {
        match &mut self.storage {
            Storage::Host(v) => v.as_mut_ptr(),
            #[cfg(feature = "cuda-runtime")]
            Storage::Cuda { slice, .. } => {
                use cudarc::driver::DevicePtr;
                slice
                    .as_ref()
                    .map(|s| *s.device_ptr() as *mut u8)
                    .unwrap_or(std::ptr::null_mut())
            }
        }
    }
}
