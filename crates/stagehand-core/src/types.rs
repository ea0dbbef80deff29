//! Descriptor vocabulary shared by every crate in the workspace.
//!
//! The serving framework describes each tensor as metadata plus an ordered
//! list of fragments: contiguous physical chunks whose in-order concatenation
//! is the tensor's full byte content.  Fragments carry raw pointers because
//! they describe framework-owned memory on either side of the CPU/GPU
//! boundary; ownership never transfers into this workspace.

// ─── Device placement ────────────────────────────────────────────────────────

/// Memory placement of a buffer or fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Host (CPU) memory.
    Host,
    /// CUDA device memory.
    Cuda,
}

impl DeviceKind {
    /// `true` for host-resident placements.
    pub fn is_host(self) -> bool {
        matches!(self, DeviceKind::Host)
    }
}

// ─── Element types ───────────────────────────────────────────────────────────

/// Enumerated numeric element kinds the engine understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F16,
    F32,
    F64,
    Bool,
}

impl ElementType {
    /// Byte width of one element.
    pub const fn size_of(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 | ElementType::Bool => 1,
            ElementType::U16 | ElementType::I16 | ElementType::F16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 | ElementType::I64 | ElementType::F64 => 8,
        }
    }
}

// ─── Shapes and metadata ─────────────────────────────────────────────────────

/// Tensor extents with a leading batch (sample count) dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorShape {
    dims: Vec<i64>,
}

impl TensorShape {
    pub fn new(dims: Vec<i64>) -> Self {
        Self { dims }
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// Leading (batch) dimension; zero for an empty shape.
    pub fn num_samples(&self) -> i64 {
        self.dims.first().copied().unwrap_or(0)
    }

    /// Product of all extents.
    pub fn num_elements(&self) -> i64 {
        self.dims.iter().product()
    }
}

/// Per-tensor metadata supplied by the serving framework.
#[derive(Clone, Debug)]
pub struct TensorMeta {
    /// Tensor name, unique within one call.
    pub name: String,
    /// Element type.
    pub dtype: ElementType,
    /// Full shape including the batch dimension.
    pub shape: TensorShape,
}

impl TensorMeta {
    /// Total byte size of the tensor described by this metadata.
    pub fn byte_size(&self) -> usize {
        self.shape.num_elements() as usize * self.dtype.size_of()
    }
}

// ─── Fragments ───────────────────────────────────────────────────────────────

/// One contiguous, read-only physical chunk of a tensor's bytes.
#[derive(Clone, Copy, Debug)]
pub struct InputFragment {
    /// Start of the chunk.
    pub ptr: *const u8,
    /// Chunk length in bytes.
    pub size: usize,
    /// Placement of the chunk.
    pub device: DeviceKind,
    /// Device ordinal for device-resident chunks; 0 for host memory.
    pub device_id: i32,
}

// SAFETY: a fragment is a plain pointer/size view of framework-owned memory.
// The framework guarantees the region stays valid and unmodified for the
// duration of the call, and copy workers only read through it.
unsafe impl Send for InputFragment {}
unsafe impl Sync for InputFragment {}

/// One contiguous, writable physical chunk of a destination tensor.
#[derive(Clone, Copy, Debug)]
pub struct OutputFragment {
    /// Start of the chunk.
    pub ptr: *mut u8,
    /// Chunk length in bytes.
    pub size: usize,
    /// Placement of the chunk.
    pub device: DeviceKind,
    /// Device ordinal for device-resident chunks; 0 for host memory.
    pub device_id: i32,
}

// SAFETY: destination fragments are disjoint framework-owned regions, valid
// for the duration of the call.  The executor never hands the same byte range
// to two copy workers.
unsafe impl Send for OutputFragment {}
unsafe impl Sync for OutputFragment {}

// ─── Full I/O descriptors ────────────────────────────────────────────────────

/// Metadata plus the ordered fragment list fully describing one input tensor.
#[derive(Clone, Debug)]
pub struct InputDescriptor {
    pub meta: TensorMeta,
    /// In-order fragments whose concatenation is the tensor's byte content.
    pub fragments: Vec<InputFragment>,
}

impl InputDescriptor {
    /// Sum of all fragment sizes.
    pub fn total_bytes(&self) -> usize {
        self.fragments.iter().map(|f| f.size).sum()
    }
}

/// Metadata plus the ordered destination fragments for one output tensor.
#[derive(Clone, Debug)]
pub struct OutputDescriptor {
    pub meta: TensorMeta,
    /// In-order destination fragments receiving the engine output.
    pub fragments: Vec<OutputFragment>,
}

impl OutputDescriptor {
    /// Sum of all fragment sizes.
    pub fn total_bytes(&self) -> usize {
        self.fragments.iter().map(|f| f.size).sum()
    }
}

/// Post-run description of one engine output, sourced from engine queries.
#[derive(Clone, Debug)]
pub struct OutputInfo {
    pub shape: TensorShape,
    pub dtype: ElementType,
    pub device: DeviceKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_reports_samples_and_elements() {
        let shape = TensorShape::new(vec![4, 3, 224, 224]);
        assert_eq!(shape.num_samples(), 4);
        assert_eq!(shape.num_elements(), 4 * 3 * 224 * 224);
    }

    #[test]
    fn empty_shape_has_zero_samples() {
        let shape = TensorShape::new(vec![]);
        assert_eq!(shape.num_samples(), 0);
    }

    #[test]
    fn element_sizes_match_width() {
        assert_eq!(ElementType::U8.size_of(), 1);
        assert_eq!(ElementType::F16.size_of(), 2);
        assert_eq!(ElementType::F32.size_of(), 4);
        assert_eq!(ElementType::I64.size_of(), 8);
    }

    #[test]
    fn meta_byte_size_multiplies_elements_by_width() {
        let meta = TensorMeta {
            name: "logits".into(),
            dtype: ElementType::F32,
            shape: TensorShape::new(vec![2, 10]),
        };
        assert_eq!(meta.byte_size(), 80);
    }

    #[test]
    fn descriptor_totals_sum_fragments() {
        let data = [0u8; 24];
        let frag = |offset: usize, size: usize| InputFragment {
            ptr: data[offset..].as_ptr(),
            size,
            device: DeviceKind::Host,
            device_id: 0,
        };
        let descr = InputDescriptor {
            meta: TensorMeta {
                name: "img".into(),
                dtype: ElementType::U8,
                shape: TensorShape::new(vec![3, 8]),
            },
            fragments: vec![frag(0, 8), frag(8, 16), frag(24, 0)],
        };
        assert_eq!(descr.total_bytes(), 24);
    }
}
