//! Device copy primitive: one entry point for every placement pair.
//!
//! # Dispatch
//!
//! | src \ dst | Host | Cuda |
//! |-----------|------|------|
//! | Host      | `ptr::copy_nonoverlapping` | `memcpy_htod` |
//! | Cuda      | `memcpy_dtoh` | `memcpy_dtod` |
//!
//! # Cross-ordinal policy
//!
//! A cuda→cuda transfer between different device ordinals is issued as a
//! single `memcpy_dtod` through unified virtual addressing.  The driver
//! takes the peer path when peer access is enabled and stages through host
//! memory otherwise.  No explicit peer enablement happens here.
//!
//! # Failure mode
//!
//! Any transfer error is fatal to the current call.  A failed copy leaves
//! the destination staging buffer with undefined bytes, but those bytes are
//! never observed: consumers only read up to a descriptor size produced on
//! the success path.

use stagehand_core::error::Result;
use stagehand_core::types::DeviceKind;

#[cfg(not(feature = "cuda-runtime"))]
use stagehand_core::error::EngineError;

/// Raw CUDA stream handle for stream-ordered transfers.
/// `None` at the call sites means a synchronous (blocking) copy.
pub type RawStream = *mut core::ffi::c_void;

/// Move `len` bytes between any pair of placements.
///
/// # Safety contract
///
/// `src` must be readable and `dst` writable for `len` bytes on their
/// respective devices, and the regions must not overlap.  The fragment types
/// carry this invariant, so the function itself is not marked `unsafe`.
pub fn mem_copy(
    dst_device: DeviceKind,
    dst: *mut u8,
    src_device: DeviceKind,
    src: *const u8,
    len: usize,
    stream: Option<RawStream>,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    match (dst_device, src_device) {
        (DeviceKind::Host, DeviceKind::Host) => {
            // SAFETY: caller guarantees both regions are valid for `len`
            // bytes and disjoint.
            unsafe { std::ptr::copy_nonoverlapping(src, dst, len) };
            Ok(())
        }
        _ => device_copy(dst_device, dst, src_device, src, len, stream),
    }
}

#[cfg(feature = "cuda-runtime")]
fn device_copy(
    dst_device: DeviceKind,
    dst: *mut u8,
    src_device: DeviceKind,
    src: *const u8,
    len: usize,
    stream: Option<RawStream>,
) -> Result<()> {
    use cudarc::driver::result;

    match (dst_device, src_device) {
        (DeviceKind::Cuda, DeviceKind::Host) => {
            // SAFETY: `src` is readable host memory for `len` bytes.
            let src_slice = unsafe { std::slice::from_raw_parts(src, len) };
            match stream {
                // SAFETY: `dst` is a valid device pointer for `len` bytes.
                None => unsafe { result::memcpy_htod_sync(dst as u64, src_slice)? },
                // SAFETY: as above; `s` is a live stream on the current context.
                Some(s) => unsafe {
                    result::memcpy_htod_async(dst as u64, src_slice, s as _)?
                },
            }
        }
        (DeviceKind::Host, DeviceKind::Cuda) => {
            // SAFETY: `dst` is writable host memory for `len` bytes and no
            // other thread touches this range until the barrier.
            let dst_slice = unsafe { std::slice::from_raw_parts_mut(dst, len) };
            match stream {
                // SAFETY: `src` is a valid device pointer for `len` bytes.
                None => unsafe { result::memcpy_dtoh_sync(dst_slice, src as u64)? },
                // SAFETY: as above; `s` is a live stream on the current context.
                Some(s) => unsafe {
                    result::memcpy_dtoh_async(dst_slice, src as u64, s as _)?
                },
            }
        }
        (DeviceKind::Cuda, DeviceKind::Cuda) => {
            // Single driver call regardless of ordinals; UVA resolves the
            // peer path or stages through host (see module docs).
            match stream {
                // SAFETY: both pointers are valid device pointers for `len` bytes.
                None => unsafe { result::memcpy_dtod_sync(dst as u64, src as u64, len)? },
                // SAFETY: as above; `s` is a live stream on the current context.
                Some(s) => unsafe {
                    result::memcpy_dtod_async(dst as u64, src as u64, len, s as _)?
                },
            }
        }
        (DeviceKind::Host, DeviceKind::Host) => unreachable!("handled in mem_copy"),
    }
    Ok(())
}

#[cfg(not(feature = "cuda-runtime"))]
fn device_copy(
    _dst_device: DeviceKind,
    _dst: *mut u8,
    _src_device: DeviceKind,
    _src: *const u8,
    _len: usize,
    _stream: Option<RawStream>,
) -> Result<()> {
    Err(EngineError::RuntimeDisabled)
}

// ─── Pending copy task ───────────────────────────────────────────────────────

/// One pending fragment copy.
///
/// Tasks are independent: no task depends on another's output, so the
/// scheduler may run them in any order on any worker.  A task is created and
/// consumed within a single executor call.
#[derive(Clone, Copy, Debug)]
pub struct CopyTask {
    pub dst_device: DeviceKind,
    pub dst: *mut u8,
    pub src_device: DeviceKind,
    pub src: *const u8,
    /// Byte count; also the scheduler's load-balancing hint.
    pub len: usize,
    /// Device ordinal on which to issue the driver call when either side is
    /// device-resident (the cuda-side fragment's ordinal).
    pub device_id: i32,
    /// Stream for stream-ordered transfers; `None` for a blocking copy.
    pub stream: Option<RawStream>,
}

// SAFETY: the executor only constructs tasks over regions it sized and handed
// out before submission.  Regions stay valid until the barrier returns and no
// two tasks overlap on the destination side.
unsafe impl Send for CopyTask {}

impl CopyTask {
    /// Execute the copy on the calling thread.
    pub fn run(&self) -> Result<()> {
        #[cfg(feature = "cuda-runtime")]
        if self.dst_device == DeviceKind::Cuda || self.src_device == DeviceKind::Cuda {
            // Worker threads carry no CUDA context of their own; bind the
            // task's ordinal before touching the driver.
            cudarc::driver::CudaDevice::new(self.device_id as usize)?.bind_to_thread()?;
        }
        mem_copy(
            self.dst_device,
            self.dst,
            self.src_device,
            self.src,
            self.len,
            self.stream,
        )
    }
}
