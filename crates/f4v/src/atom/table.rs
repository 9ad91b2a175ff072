//! Sample-table atoms. All of them share the same layout (a version/flags
//! word, a record count and a run of fixed-size records), so a single
//! parameterized table implementation covers `stts`, `ctts`, `stss`, `stsc`,
//! `stco` and `co64`. `stsz` deviates (a fixed-size shortcut field) and gets
//! its own type.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::F4vError;
use crate::fourcc::FourCc;

use super::ensure;

/// The version + flags prefix shared by every versioned atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FullBox {
    pub version: u8,
    pub flags: u32,
}

impl FullBox {
    pub(crate) fn decode(body: &mut Bytes, fourcc: FourCc) -> Result<FullBox, F4vError> {
        ensure(body, 4, fourcc)?;
        let word = body.get_u32();
        Ok(FullBox {
            version: (word >> 24) as u8,
            flags: word & 0x00ff_ffff,
        })
    }

    pub(crate) fn encode(&self, out: &mut BytesMut) {
        out.put_u32(((self.version as u32) << 24) | (self.flags & 0x00ff_ffff));
    }
}

/// One fixed-size record of a sample table.
pub trait Record: Sized {
    const FOURCC: FourCc;
    const SIZE: usize;
    fn decode(body: &mut Bytes) -> Self;
    fn encode(&self, out: &mut BytesMut);
}

/// Versioned atom holding a length-prefixed run of records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTable<R: Record> {
    pub full: FullBox,
    pub records: Vec<R>,
    _marker: PhantomData<R>,
}

impl<R: Record> RecordTable<R> {
    pub fn new(records: Vec<R>) -> Self {
        RecordTable {
            full: FullBox::default(),
            records,
            _marker: PhantomData,
        }
    }

    pub(super) fn decode(body: &mut Bytes) -> Result<Self, F4vError> {
        let full = FullBox::decode(body, R::FOURCC)?;
        ensure(body, 4, R::FOURCC)?;
        let count = body.get_u32() as usize;
        ensure(body, count * R::SIZE, R::FOURCC)?;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(R::decode(body));
        }
        Ok(RecordTable {
            full,
            records,
            _marker: PhantomData,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        out.put_u32(self.records.len() as u32);
        for record in &self.records {
            record.encode(out);
        }
    }

    pub(super) fn body_size(&self) -> u64 {
        4 + 4 + (self.records.len() * R::SIZE) as u64
    }
}

/// `stts` record: a run of samples sharing one decoding delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeToSampleRecord {
    pub sample_count: u32,
    pub sample_delta: u32,
}

impl Record for TimeToSampleRecord {
    const FOURCC: FourCc = FourCc::STTS;
    const SIZE: usize = 8;

    fn decode(body: &mut Bytes) -> Self {
        TimeToSampleRecord {
            sample_count: body.get_u32(),
            sample_delta: body.get_u32(),
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.sample_count);
        out.put_u32(self.sample_delta);
    }
}

/// `ctts` record: composition offset for a run of samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositionOffsetRecord {
    pub sample_count: u32,
    pub composition_offset: u32,
}

impl Record for CompositionOffsetRecord {
    const FOURCC: FourCc = FourCc::CTTS;
    const SIZE: usize = 8;

    fn decode(body: &mut Bytes) -> Self {
        CompositionOffsetRecord {
            sample_count: body.get_u32(),
            composition_offset: body.get_u32(),
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.sample_count);
        out.put_u32(self.composition_offset);
    }
}

/// `stss` record: 1-based index of a sync sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSampleRecord {
    pub sample_number: u32,
}

impl Record for SyncSampleRecord {
    const FOURCC: FourCc = FourCc::STSS;
    const SIZE: usize = 4;

    fn decode(body: &mut Bytes) -> Self {
        SyncSampleRecord {
            sample_number: body.get_u32(),
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.sample_number);
    }
}

/// `stsc` record: chunk run description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleToChunkRecord {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_id: u32,
}

impl Record for SampleToChunkRecord {
    const FOURCC: FourCc = FourCc::STSC;
    const SIZE: usize = 12;

    fn decode(body: &mut Bytes) -> Self {
        SampleToChunkRecord {
            first_chunk: body.get_u32(),
            samples_per_chunk: body.get_u32(),
            sample_description_id: body.get_u32(),
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.first_chunk);
        out.put_u32(self.samples_per_chunk);
        out.put_u32(self.sample_description_id);
    }
}

/// `stco` record: 32-bit chunk offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOffsetRecord {
    pub offset: u32,
}

impl Record for ChunkOffsetRecord {
    const FOURCC: FourCc = FourCc::STCO;
    const SIZE: usize = 4;

    fn decode(body: &mut Bytes) -> Self {
        ChunkOffsetRecord {
            offset: body.get_u32(),
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.offset);
    }
}

/// `co64` record: 64-bit chunk offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOffset64Record {
    pub offset: u64,
}

impl Record for ChunkOffset64Record {
    const FOURCC: FourCc = FourCc::CO64;
    const SIZE: usize = 8;

    fn decode(body: &mut Bytes) -> Self {
        ChunkOffset64Record {
            offset: body.get_u64(),
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u64(self.offset);
    }
}

/// `stsz`: per-sample sizes, or one shared size when `sample_size != 0`
/// (in which case the explicit list is absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StszAtom {
    pub full: FullBox,
    pub sample_size: u32,
    pub sample_count: u32,
    pub sizes: Vec<u32>,
}

impl StszAtom {
    pub(super) fn decode(body: &mut Bytes) -> Result<StszAtom, F4vError> {
        let full = FullBox::decode(body, FourCc::STSZ)?;
        ensure(body, 8, FourCc::STSZ)?;
        let sample_size = body.get_u32();
        let sample_count = body.get_u32();
        let mut sizes = Vec::new();
        if sample_size == 0 {
            ensure(body, sample_count as usize * 4, FourCc::STSZ)?;
            sizes.reserve(sample_count as usize);
            for _ in 0..sample_count {
                sizes.push(body.get_u32());
            }
        }
        Ok(StszAtom {
            full,
            sample_size,
            sample_count,
            sizes,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        out.put_u32(self.sample_size);
        out.put_u32(self.sample_count);
        if self.sample_size == 0 {
            for size in &self.sizes {
                out.put_u32(*size);
            }
        }
    }

    pub(super) fn body_size(&self) -> u64 {
        let list = if self.sample_size == 0 {
            4 * self.sizes.len() as u64
        } else {
            0
        };
        4 + 8 + list
    }

    /// Size of the 0-based sample `index`.
    pub fn size_of(&self, index: u32) -> u32 {
        if self.sample_size != 0 {
            self.sample_size
        } else {
            self.sizes.get(index as usize).copied().unwrap_or(0)
        }
    }
}
