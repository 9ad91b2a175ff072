//! The atom model.
//!
//! Every atom starts with a 4-byte big-endian total size and a 4-byte type
//! code. A size of 1 switches to a 64-bit size carried in the next 8 bytes;
//! a size of 0 extends the atom to the end of the stream. Bodies are either
//! typed fields, a sequence of subatoms (containers), a version/flags prefix
//! followed by a versioned payload, or, for types this crate does not
//! recognize, opaque bytes preserved verbatim.

mod movie;
mod sample;
mod table;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::F4vError;
use crate::fourcc::FourCc;

pub use movie::{
    FtypAtom, HdlrAtom, MdatAtom, MdhdAtom, MetaAtom, MvhdAtom, SmhdAtom, TkhdAtom, VmhdAtom,
};
pub use sample::{Avc1Atom, AvccAtom, EsdsAtom, Mp4aAtom, StsdAtom};
pub use table::{
    ChunkOffset64Record, ChunkOffsetRecord, CompositionOffsetRecord, FullBox, Record,
    RecordTable, SampleToChunkRecord, StszAtom, SyncSampleRecord, TimeToSampleRecord,
};

/// Fixed header of an atom as found in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomHeader {
    /// Total atom size, header included. Already resolved for the extended
    /// and to-end-of-stream encodings.
    pub size: u64,
    pub fourcc: FourCc,
    /// 8 for the compact form, 16 for the extended form.
    pub header_len: u8,
    /// Absolute stream offset of the atom's first byte.
    pub position: u64,
}

impl AtomHeader {
    pub fn body_size(&self) -> u64 {
        self.size - self.header_len as u64
    }

    pub fn is_extended(&self) -> bool {
        self.header_len == 16
    }

    /// Peek an atom header from the start of `buf` without consuming.
    ///
    /// Returns `Ok(None)` when fewer than the header bytes are buffered.
    /// `stream_remaining` resolves the size==0 ("rest of stream") encoding.
    pub fn peek(
        buf: &[u8],
        position: u64,
        stream_remaining: u64,
    ) -> Result<Option<AtomHeader>, F4vError> {
        if buf.len() < 8 {
            return Ok(None);
        }
        let mut size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64;
        let fourcc = FourCc([buf[4], buf[5], buf[6], buf[7]]);
        let mut header_len = 8u8;
        if size == 1 {
            if buf.len() < 16 {
                return Ok(None);
            }
            size = u64::from_be_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]);
            header_len = 16;
        }
        if size == 0 {
            size = stream_remaining;
        }
        if size < header_len as u64 {
            return Err(F4vError::AtomSizeTooSmall { fourcc, size });
        }
        Ok(Some(AtomHeader {
            size,
            fourcc,
            header_len,
            position,
        }))
    }
}

/// A decoded atom: stream placement plus the typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    /// Keep the extended 64-bit size encoding on re-encode.
    pub extended: bool,
    /// Absolute stream offset where the atom was decoded (0 for atoms built
    /// programmatically).
    pub position: u64,
    pub body: AtomBody,
}

/// A sequence of subatoms; the body of every plain container type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerAtom {
    pub children: Vec<Atom>,
}

impl ContainerAtom {
    pub fn find(&self, fourcc: FourCc) -> Option<&Atom> {
        self.children.iter().find(|a| a.fourcc() == fourcc)
    }

    pub fn find_mut(&mut self, fourcc: FourCc) -> Option<&mut Atom> {
        self.children.iter_mut().find(|a| a.fourcc() == fourcc)
    }
}

/// An unrecognized atom, preserved verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAtom {
    pub fourcc: FourCc,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AtomBody {
    Ftyp(FtypAtom),
    Moov(ContainerAtom),
    Mvhd(MvhdAtom),
    Trak(ContainerAtom),
    Tkhd(TkhdAtom),
    Mdia(ContainerAtom),
    Mdhd(MdhdAtom),
    Hdlr(HdlrAtom),
    Minf(ContainerAtom),
    Vmhd(VmhdAtom),
    Smhd(SmhdAtom),
    Dinf(ContainerAtom),
    Stbl(ContainerAtom),
    Edts(ContainerAtom),
    Udta(ContainerAtom),
    Wave(ContainerAtom),
    Meta(MetaAtom),
    Stsd(StsdAtom),
    Avc1(Avc1Atom),
    Avcc(AvccAtom),
    Mp4a(Mp4aAtom),
    Esds(EsdsAtom),
    Stts(RecordTable<TimeToSampleRecord>),
    Ctts(RecordTable<CompositionOffsetRecord>),
    Stss(RecordTable<SyncSampleRecord>),
    Stsc(RecordTable<SampleToChunkRecord>),
    Stsz(StszAtom),
    Stco(RecordTable<ChunkOffsetRecord>),
    Co64(RecordTable<ChunkOffset64Record>),
    Mdat(MdatAtom),
    Free(Bytes),
    /// The four-zero-bytes terminator atom.
    Null(Bytes),
    Raw(RawAtom),
}

pub(crate) fn ensure(buf: &Bytes, needed: usize, fourcc: FourCc) -> Result<(), F4vError> {
    if buf.len() < needed {
        return Err(F4vError::TruncatedBody {
            fourcc,
            expected: needed as u64,
            got: buf.len(),
        });
    }
    Ok(())
}

/// Decode a sequence of complete atoms filling `body` (container bodies,
/// subatom runs inside sample entries).
pub(crate) fn decode_children(body: &mut Bytes, position: u64) -> Result<Vec<Atom>, F4vError> {
    let mut children = Vec::new();
    let mut offset = position;
    while !body.is_empty() {
        let remaining = body.len() as u64;
        let header = match AtomHeader::peek(body, offset, remaining)? {
            Some(header) => header,
            // A container body is complete by construction; a partial child
            // header means the parent's size field lied.
            None => {
                return Err(F4vError::MalformedAtom {
                    fourcc: FourCc::NULL,
                    reason: "trailing bytes too short for a subatom header",
                });
            }
        };
        if header.size > body.len() as u64 {
            return Err(F4vError::TruncatedBody {
                fourcc: header.fourcc,
                expected: header.size,
                got: body.len(),
            });
        }
        body.advance(header.header_len as usize);
        let mut child_body = body.split_to(header.body_size() as usize);
        children.push(Atom::decode(&header, &mut child_body)?);
        offset += header.size;
    }
    Ok(children)
}

pub(crate) fn encode_children(children: &[Atom], out: &mut BytesMut) {
    for child in children {
        child.encode(out);
    }
}

pub(crate) fn children_size(children: &[Atom]) -> u64 {
    children.iter().map(Atom::size).sum()
}

impl Atom {
    /// Decode the atom whose header was peeked and whose complete body sits
    /// in `body`. `mdat` is the exception: its body stays in the stream and
    /// `body` must be empty.
    pub fn decode(header: &AtomHeader, body: &mut Bytes) -> Result<Atom, F4vError> {
        let body_position = header.position + header.header_len as u64;
        let atom_body = match header.fourcc {
            FourCc::FTYP => AtomBody::Ftyp(FtypAtom::decode(body)?),
            FourCc::MOOV => AtomBody::Moov(ContainerAtom {
                children: decode_children(body, body_position)?,
            }),
            FourCc::MVHD => AtomBody::Mvhd(MvhdAtom::decode(body)?),
            FourCc::TRAK => AtomBody::Trak(ContainerAtom {
                children: decode_children(body, body_position)?,
            }),
            FourCc::TKHD => AtomBody::Tkhd(TkhdAtom::decode(body)?),
            FourCc::MDIA => AtomBody::Mdia(ContainerAtom {
                children: decode_children(body, body_position)?,
            }),
            FourCc::MDHD => AtomBody::Mdhd(MdhdAtom::decode(body)?),
            FourCc::HDLR => AtomBody::Hdlr(HdlrAtom::decode(body)?),
            FourCc::MINF => AtomBody::Minf(ContainerAtom {
                children: decode_children(body, body_position)?,
            }),
            FourCc::VMHD => AtomBody::Vmhd(VmhdAtom::decode(body)?),
            FourCc::SMHD => AtomBody::Smhd(SmhdAtom::decode(body)?),
            FourCc::DINF => AtomBody::Dinf(ContainerAtom {
                children: decode_children(body, body_position)?,
            }),
            FourCc::STBL => AtomBody::Stbl(ContainerAtom {
                children: decode_children(body, body_position)?,
            }),
            FourCc::EDTS => AtomBody::Edts(ContainerAtom {
                children: decode_children(body, body_position)?,
            }),
            FourCc::UDTA => AtomBody::Udta(ContainerAtom {
                children: decode_children(body, body_position)?,
            }),
            FourCc::WAVE => AtomBody::Wave(ContainerAtom {
                children: decode_children(body, body_position)?,
            }),
            FourCc::META => AtomBody::Meta(MetaAtom::decode(body, body_position)?),
            FourCc::STSD => AtomBody::Stsd(StsdAtom::decode(body, body_position)?),
            FourCc::AVC1 => AtomBody::Avc1(Avc1Atom::decode(body, body_position)?),
            FourCc::AVCC => AtomBody::Avcc(AvccAtom::decode(body)?),
            FourCc::MP4A => AtomBody::Mp4a(Mp4aAtom::decode(body, body_position)?),
            FourCc::ESDS => AtomBody::Esds(EsdsAtom::decode(body)?),
            FourCc::STTS => AtomBody::Stts(RecordTable::decode(body)?),
            FourCc::CTTS => AtomBody::Ctts(RecordTable::decode(body)?),
            FourCc::STSS => AtomBody::Stss(RecordTable::decode(body)?),
            FourCc::STSC => AtomBody::Stsc(RecordTable::decode(body)?),
            FourCc::STSZ => AtomBody::Stsz(StszAtom::decode(body)?),
            FourCc::STCO => AtomBody::Stco(RecordTable::decode(body)?),
            FourCc::CO64 => AtomBody::Co64(RecordTable::decode(body)?),
            FourCc::MDAT => AtomBody::Mdat(MdatAtom {
                data_size: header.body_size(),
            }),
            FourCc::FREE => AtomBody::Free(body.split_to(body.len())),
            FourCc::NULL => AtomBody::Null(body.split_to(body.len())),
            other => AtomBody::Raw(RawAtom {
                fourcc: other,
                data: body.split_to(body.len()),
            }),
        };
        if !body.is_empty() {
            return Err(F4vError::MalformedAtom {
                fourcc: header.fourcc,
                reason: "body decode left trailing bytes",
            });
        }
        Ok(Atom {
            extended: header.is_extended(),
            position: header.position,
            body: atom_body,
        })
    }

    pub fn fourcc(&self) -> FourCc {
        match &self.body {
            AtomBody::Ftyp(_) => FourCc::FTYP,
            AtomBody::Moov(_) => FourCc::MOOV,
            AtomBody::Mvhd(_) => FourCc::MVHD,
            AtomBody::Trak(_) => FourCc::TRAK,
            AtomBody::Tkhd(_) => FourCc::TKHD,
            AtomBody::Mdia(_) => FourCc::MDIA,
            AtomBody::Mdhd(_) => FourCc::MDHD,
            AtomBody::Hdlr(_) => FourCc::HDLR,
            AtomBody::Minf(_) => FourCc::MINF,
            AtomBody::Vmhd(_) => FourCc::VMHD,
            AtomBody::Smhd(_) => FourCc::SMHD,
            AtomBody::Dinf(_) => FourCc::DINF,
            AtomBody::Stbl(_) => FourCc::STBL,
            AtomBody::Edts(_) => FourCc::EDTS,
            AtomBody::Udta(_) => FourCc::UDTA,
            AtomBody::Wave(_) => FourCc::WAVE,
            AtomBody::Meta(_) => FourCc::META,
            AtomBody::Stsd(_) => FourCc::STSD,
            AtomBody::Avc1(_) => FourCc::AVC1,
            AtomBody::Avcc(_) => FourCc::AVCC,
            AtomBody::Mp4a(_) => FourCc::MP4A,
            AtomBody::Esds(_) => FourCc::ESDS,
            AtomBody::Stts(_) => FourCc::STTS,
            AtomBody::Ctts(_) => FourCc::CTTS,
            AtomBody::Stss(_) => FourCc::STSS,
            AtomBody::Stsc(_) => FourCc::STSC,
            AtomBody::Stsz(_) => FourCc::STSZ,
            AtomBody::Stco(_) => FourCc::STCO,
            AtomBody::Co64(_) => FourCc::CO64,
            AtomBody::Mdat(_) => FourCc::MDAT,
            AtomBody::Free(_) => FourCc::FREE,
            AtomBody::Null(_) => FourCc::NULL,
            AtomBody::Raw(raw) => raw.fourcc,
        }
    }

    /// Size of the body when re-encoded.
    pub fn body_size(&self) -> u64 {
        match &self.body {
            AtomBody::Ftyp(a) => a.body_size(),
            AtomBody::Moov(c)
            | AtomBody::Trak(c)
            | AtomBody::Mdia(c)
            | AtomBody::Minf(c)
            | AtomBody::Dinf(c)
            | AtomBody::Stbl(c)
            | AtomBody::Edts(c)
            | AtomBody::Udta(c)
            | AtomBody::Wave(c) => children_size(&c.children),
            AtomBody::Mvhd(a) => a.body_size(),
            AtomBody::Tkhd(a) => a.body_size(),
            AtomBody::Mdhd(a) => a.body_size(),
            AtomBody::Hdlr(a) => a.body_size(),
            AtomBody::Vmhd(a) => a.body_size(),
            AtomBody::Smhd(a) => a.body_size(),
            AtomBody::Meta(a) => a.body_size(),
            AtomBody::Stsd(a) => a.body_size(),
            AtomBody::Avc1(a) => a.body_size(),
            AtomBody::Avcc(a) => a.body_size(),
            AtomBody::Mp4a(a) => a.body_size(),
            AtomBody::Esds(a) => a.body_size(),
            AtomBody::Stts(a) => a.body_size(),
            AtomBody::Ctts(a) => a.body_size(),
            AtomBody::Stss(a) => a.body_size(),
            AtomBody::Stsc(a) => a.body_size(),
            AtomBody::Stsz(a) => a.body_size(),
            AtomBody::Stco(a) => a.body_size(),
            AtomBody::Co64(a) => a.body_size(),
            AtomBody::Mdat(a) => a.data_size,
            AtomBody::Free(data) | AtomBody::Null(data) => data.len() as u64,
            AtomBody::Raw(raw) => raw.data.len() as u64,
        }
    }

    fn header_len(&self) -> u64 {
        if self.needs_extended_size() { 16 } else { 8 }
    }

    fn needs_extended_size(&self) -> bool {
        self.extended || 8 + self.body_size() > u32::MAX as u64
    }

    /// Total atom size, header included.
    pub fn size(&self) -> u64 {
        self.header_len() + self.body_size()
    }

    /// Subatoms of container bodies (plain or versioned).
    pub fn children(&self) -> Option<&[Atom]> {
        match &self.body {
            AtomBody::Moov(c)
            | AtomBody::Trak(c)
            | AtomBody::Mdia(c)
            | AtomBody::Minf(c)
            | AtomBody::Dinf(c)
            | AtomBody::Stbl(c)
            | AtomBody::Edts(c)
            | AtomBody::Udta(c)
            | AtomBody::Wave(c) => Some(&c.children),
            AtomBody::Meta(meta) => Some(&meta.children),
            AtomBody::Stsd(stsd) => Some(&stsd.entries),
            AtomBody::Avc1(avc1) => Some(&avc1.children),
            AtomBody::Mp4a(mp4a) => Some(&mp4a.children),
            _ => None,
        }
    }

    /// Write the complete atom: size field (extended when required or
    /// preserved from decode), type code and body. `mdat` writes its header
    /// only; the caller streams the payload.
    pub fn encode(&self, out: &mut BytesMut) {
        let body_size = self.body_size();
        if self.needs_extended_size() {
            out.put_u32(1);
            out.put_slice(&self.fourcc().0);
            out.put_u64(16 + body_size);
        } else {
            out.put_u32((8 + body_size) as u32);
            out.put_slice(&self.fourcc().0);
        }
        let body_start = out.len();
        match &self.body {
            AtomBody::Ftyp(a) => a.encode(out),
            AtomBody::Moov(c)
            | AtomBody::Trak(c)
            | AtomBody::Mdia(c)
            | AtomBody::Minf(c)
            | AtomBody::Dinf(c)
            | AtomBody::Stbl(c)
            | AtomBody::Edts(c)
            | AtomBody::Udta(c)
            | AtomBody::Wave(c) => encode_children(&c.children, out),
            AtomBody::Mvhd(a) => a.encode(out),
            AtomBody::Tkhd(a) => a.encode(out),
            AtomBody::Mdhd(a) => a.encode(out),
            AtomBody::Hdlr(a) => a.encode(out),
            AtomBody::Vmhd(a) => a.encode(out),
            AtomBody::Smhd(a) => a.encode(out),
            AtomBody::Meta(a) => a.encode(out),
            AtomBody::Stsd(a) => a.encode(out),
            AtomBody::Avc1(a) => a.encode(out),
            AtomBody::Avcc(a) => a.encode(out),
            AtomBody::Mp4a(a) => a.encode(out),
            AtomBody::Esds(a) => a.encode(out),
            AtomBody::Stts(a) => a.encode(out),
            AtomBody::Ctts(a) => a.encode(out),
            AtomBody::Stss(a) => a.encode(out),
            AtomBody::Stsc(a) => a.encode(out),
            AtomBody::Stsz(a) => a.encode(out),
            AtomBody::Stco(a) => a.encode(out),
            AtomBody::Co64(a) => a.encode(out),
            AtomBody::Mdat(_) => {}
            AtomBody::Free(data) | AtomBody::Null(data) => out.put_slice(data),
            AtomBody::Raw(raw) => out.put_slice(&raw.data),
        }
        // Measured body size must match the encoded body; mdat is exempt
        // because its payload is streamed by the caller.
        if !matches!(self.body, AtomBody::Mdat(_)) {
            debug_assert_eq!(
                (out.len() - body_start) as u64,
                body_size,
                "{} body size mismatch",
                self.fourcc()
            );
        }
    }

    /// Subatoms of container bodies, mutable.
    pub fn children_mut(&mut self) -> Option<&mut Vec<Atom>> {
        match &mut self.body {
            AtomBody::Moov(c)
            | AtomBody::Trak(c)
            | AtomBody::Mdia(c)
            | AtomBody::Minf(c)
            | AtomBody::Dinf(c)
            | AtomBody::Stbl(c)
            | AtomBody::Edts(c)
            | AtomBody::Udta(c)
            | AtomBody::Wave(c) => Some(&mut c.children),
            AtomBody::Meta(meta) => Some(&mut meta.children),
            AtomBody::Stsd(stsd) => Some(&mut stsd.entries),
            AtomBody::Avc1(avc1) => Some(&mut avc1.children),
            AtomBody::Mp4a(mp4a) => Some(&mut mp4a.children),
            _ => None,
        }
    }

    pub(crate) fn set_extended_recursive(&mut self) {
        self.extended = true;
        if let Some(children) = self.children_mut() {
            for child in children {
                child.set_extended_recursive();
            }
        }
    }

    /// Shorthand for building an atom programmatically.
    pub fn from_body(body: AtomBody) -> Atom {
        Atom {
            extended: false,
            position: 0,
            body,
        }
    }
}
