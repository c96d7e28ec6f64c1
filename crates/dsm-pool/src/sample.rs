//! Time-tagged sample records and their identifiers.
//!
//! A [`Sample`] is an immutable, atomically reference counted handle. Cloning
//! a `Sample` takes another reference; dropping it releases one. When the last
//! reference goes away the payload buffer is handed back to the [`SamplePool`]
//! it was taken from, so steady-state acquisition does not allocate.
//!
//! ## Memory Flow
//!
//! ```text
//! 1. SamplePools::get_sample() hands out a PooledSample (exclusive, mutable)
//! 2. The producer fills timestamp, id and payload
//! 3. freeze() converts it into a Sample (Arc, no copy)
//! 4. Sample clones are fanned out to any number of clients
//! 5. When the last clone drops, SampleInner::drop() returns the buffer
//! ```
//!
//! [`SamplePool`]: crate::SamplePool

use std::fmt;
use std::sync::Arc;

use crate::pool::PoolShared;
use crate::SamplePools;

/// Sample timestamp: microseconds since 1970-01-01 00:00 UTC.
pub type DsmTime = i64;

/// Microseconds per millisecond.
pub const USECS_PER_MSEC: DsmTime = 1_000;

/// Microseconds per second.
pub const USECS_PER_SEC: DsmTime = 1_000_000;

/// Identifier of a sample stream.
///
/// Bits 16..26 carry the 10-bit DSM (acquisition host) id, bits 0..16 the
/// sensor/sample (SPS) id. The top six bits are reserved and preserved as-is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleId(u32);

impl SampleId {
    /// Largest representable DSM id.
    pub const MAX_DSM_ID: u16 = 0x3ff;

    const DSM_SHIFT: u32 = 16;
    const DSM_MASK: u32 = 0x3ff;
    const SPS_MASK: u32 = 0xffff;

    /// Build an id from its DSM and SPS parts. DSM ids above 1023 are truncated.
    #[must_use]
    pub const fn new(dsm_id: u16, sps_id: u16) -> Self {
        Self((((dsm_id as u32) & Self::DSM_MASK) << Self::DSM_SHIFT) | sps_id as u32)
    }

    /// Wrap a raw 32-bit id as found on the wire.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw 32-bit value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The 10-bit DSM id.
    #[must_use]
    pub const fn dsm_id(self) -> u16 {
        ((self.0 >> Self::DSM_SHIFT) & Self::DSM_MASK) as u16
    }

    /// The 16-bit sensor/sample id.
    #[must_use]
    pub const fn sps_id(self) -> u16 {
        (self.0 & Self::SPS_MASK) as u16
    }

    /// Same DSM id, different SPS id.
    #[must_use]
    pub const fn with_sps_id(self, sps_id: u16) -> Self {
        Self((self.0 & !Self::SPS_MASK) | sps_id as u32)
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.dsm_id(), self.sps_id())
    }
}

/// Element type of a sample payload, with its wire code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SampleType {
    /// Signed 8-bit / text.
    Char = 0,
    /// Unsigned 8-bit.
    UChar = 1,
    /// Signed 16-bit.
    Short = 2,
    /// Unsigned 16-bit.
    UShort = 3,
    /// Signed 32-bit.
    Int32 = 4,
    /// Unsigned 32-bit.
    UInt32 = 5,
    /// IEEE 754 single precision.
    Float = 6,
    /// IEEE 754 double precision.
    Double = 7,
    /// Signed 64-bit.
    Int64 = 8,
    /// Type code not understood; payload treated as bytes.
    Unknown = 9,
}

impl SampleType {
    /// Every type, indexed by wire code.
    pub const ALL: [SampleType; 10] = [
        SampleType::Char,
        SampleType::UChar,
        SampleType::Short,
        SampleType::UShort,
        SampleType::Int32,
        SampleType::UInt32,
        SampleType::Float,
        SampleType::Double,
        SampleType::Int64,
        SampleType::Unknown,
    ];

    /// Decode a wire type code. Returns `None` for codes outside `0..=9`.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    /// Wire code of this type.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Size in bytes of one element.
    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            SampleType::Char | SampleType::UChar | SampleType::Unknown => 1,
            SampleType::Short | SampleType::UShort => 2,
            SampleType::Int32 | SampleType::UInt32 | SampleType::Float => 4,
            SampleType::Double | SampleType::Int64 => 8,
        }
    }

    /// Short lowercase name, used in logs and dumps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            SampleType::Char => "char",
            SampleType::UChar => "uchar",
            SampleType::Short => "short",
            SampleType::UShort => "ushort",
            SampleType::Int32 => "int32",
            SampleType::UInt32 => "uint32",
            SampleType::Float => "float",
            SampleType::Double => "double",
            SampleType::Int64 => "int64",
            SampleType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Storage shared by [`PooledSample`] and [`Sample`].
///
/// `buffer.len()` is the allocated byte length; `len` is the valid length.
pub(crate) struct SampleInner {
    pub(crate) timestamp: DsmTime,
    pub(crate) id: SampleId,
    pub(crate) sample_type: SampleType,
    pub(crate) buffer: Vec<u8>,
    pub(crate) len: usize,
    pub(crate) home: Option<Arc<PoolShared>>,
}

impl Drop for SampleInner {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.put(std::mem::take(&mut self.buffer));
        }
    }
}

/// A sample under construction, exclusively owned by its producer.
///
/// Dropping it without freezing returns the buffer to its pool.
pub struct PooledSample {
    inner: SampleInner,
}

impl PooledSample {
    pub(crate) fn from_buffer(
        sample_type: SampleType,
        buffer: Vec<u8>,
        len: usize,
        home: Option<Arc<PoolShared>>,
    ) -> Self {
        Self {
            inner: SampleInner {
                timestamp: 0,
                id: SampleId::default(),
                sample_type,
                buffer,
                len,
                home,
            },
        }
    }

    /// Allocate a sample that does not belong to any pool.
    #[must_use]
    pub fn standalone(sample_type: SampleType, byte_len: usize) -> Self {
        Self::from_buffer(sample_type, vec![0; byte_len], byte_len, None)
    }

    /// Timestamp in microseconds since the epoch.
    #[must_use]
    pub fn timestamp(&self) -> DsmTime {
        self.inner.timestamp
    }

    /// Set the timestamp.
    pub fn set_timestamp(&mut self, timestamp: DsmTime) {
        self.inner.timestamp = timestamp;
    }

    /// Sample id.
    #[must_use]
    pub fn id(&self) -> SampleId {
        self.inner.id
    }

    /// Set the sample id.
    pub fn set_id(&mut self, id: SampleId) {
        self.inner.id = id;
    }

    /// Payload element type.
    #[must_use]
    pub fn sample_type(&self) -> SampleType {
        self.inner.sample_type
    }

    /// Valid payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// True when the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Allocated payload length in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Set the valid payload length, growing the buffer if needed.
    pub fn set_len(&mut self, len: usize) {
        if len > self.inner.buffer.len() {
            self.inner.buffer.resize(len, 0);
        }
        self.inner.len = len;
    }

    /// Valid payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.inner.buffer[..self.inner.len]
    }

    /// Mutable access to the valid payload bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.inner.buffer[..self.inner.len]
    }

    /// Replace the payload with `src`.
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        self.set_len(src.len());
        self.inner.buffer[..src.len()].copy_from_slice(src);
    }

    /// Convert into a shareable [`Sample`]. No data is copied.
    #[must_use]
    pub fn freeze(self) -> Sample {
        Sample {
            inner: Arc::new(self.inner),
        }
    }
}

impl fmt::Debug for PooledSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSample")
            .field("timestamp", &self.inner.timestamp)
            .field("id", &self.inner.id)
            .field("type", &self.inner.sample_type)
            .field("len", &self.inner.len)
            .finish()
    }
}

/// Immutable, reference counted sample.
///
/// `clone()` holds another reference, `drop()` frees one. A client that wants
/// to keep a sample it was handed by reference simply clones it.
#[derive(Clone)]
pub struct Sample {
    inner: Arc<SampleInner>,
}

impl Sample {
    /// Build a standalone sample from parts (tests, tools, processors).
    #[must_use]
    pub fn standalone(
        timestamp: DsmTime,
        id: SampleId,
        sample_type: SampleType,
        data: &[u8],
    ) -> Self {
        let mut sample = PooledSample::standalone(sample_type, data.len());
        sample.set_timestamp(timestamp);
        sample.set_id(id);
        sample.copy_from_slice(data);
        sample.freeze()
    }

    /// Timestamp in microseconds since the epoch.
    #[must_use]
    pub fn timestamp(&self) -> DsmTime {
        self.inner.timestamp
    }

    /// Sample id.
    #[must_use]
    pub fn id(&self) -> SampleId {
        self.inner.id
    }

    /// DSM part of the id.
    #[must_use]
    pub fn dsm_id(&self) -> u16 {
        self.inner.id.dsm_id()
    }

    /// SPS part of the id.
    #[must_use]
    pub fn sps_id(&self) -> u16 {
        self.inner.id.sps_id()
    }

    /// Payload element type.
    #[must_use]
    pub fn sample_type(&self) -> SampleType {
        self.inner.sample_type
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// True when the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.inner.buffer[..self.inner.len]
    }

    /// Number of whole elements in the payload.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.inner.len / self.inner.sample_type.element_size()
    }

    /// Number of live references to this sample.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True when both handles refer to the same sample.
    #[must_use]
    pub fn ptr_eq(&self, other: &Sample) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Decode the payload elements (little-endian) as `f64`.
    ///
    /// `Unknown` payloads decode as unsigned bytes. Trailing partial elements
    /// are ignored.
    #[must_use]
    pub fn values_f64(&self) -> Vec<f64> {
        let size = self.inner.sample_type.element_size();
        self.data()
            .chunks_exact(size)
            .map(|c| decode_element(self.inner.sample_type, c))
            .collect()
    }

    /// Private mutable copy of this sample, taken from `pools`.
    #[must_use]
    pub fn copy_into(&self, pools: &SamplePools) -> PooledSample {
        let mut copy = pools.get_sample(self.inner.sample_type, self.inner.len);
        copy.set_timestamp(self.inner.timestamp);
        copy.set_id(self.inner.id);
        copy.copy_from_slice(self.data());
        copy
    }
}

fn decode_element(sample_type: SampleType, c: &[u8]) -> f64 {
    let mut b8 = [0u8; 8];
    b8[..c.len()].copy_from_slice(c);
    match sample_type {
        SampleType::Char => f64::from(c[0] as i8),
        SampleType::UChar | SampleType::Unknown => f64::from(c[0]),
        SampleType::Short => f64::from(i16::from_le_bytes([c[0], c[1]])),
        SampleType::UShort => f64::from(u16::from_le_bytes([c[0], c[1]])),
        SampleType::Int32 => f64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        SampleType::UInt32 => f64::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        SampleType::Float => f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        SampleType::Double => f64::from_le_bytes(b8),
        SampleType::Int64 => i64::from_le_bytes(b8) as f64,
    }
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("timestamp", &self.inner.timestamp)
            .field("id", &self.inner.id)
            .field("type", &self.inner.sample_type)
            .field("len", &self.inner.len)
            .field("refs", &self.ref_count())
            .finish()
    }
}
