//! Movie-level typed atoms: file type, movie/track/media headers, the media
//! handler and the mdat marker.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::F4vError;
use crate::fourcc::FourCc;

use super::{Atom, FullBox, decode_children, encode_children, ensure};

/// `ftyp`: major brand, minor version and the compatible brand list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtypAtom {
    pub major_brand: FourCc,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCc>,
}

impl FtypAtom {
    pub(super) fn decode(body: &mut Bytes) -> Result<FtypAtom, F4vError> {
        ensure(body, 8, FourCc::FTYP)?;
        let major_brand = FourCc(body.get_u32().to_be_bytes());
        let minor_version = body.get_u32();
        if body.len() % 4 != 0 {
            return Err(F4vError::MalformedAtom {
                fourcc: FourCc::FTYP,
                reason: "compatible brand list not a multiple of 4 bytes",
            });
        }
        let mut compatible_brands = Vec::with_capacity(body.len() / 4);
        while !body.is_empty() {
            compatible_brands.push(FourCc(body.get_u32().to_be_bytes()));
        }
        Ok(FtypAtom {
            major_brand,
            minor_version,
            compatible_brands,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        out.put_slice(&self.major_brand.0);
        out.put_u32(self.minor_version);
        for brand in &self.compatible_brands {
            out.put_slice(&brand.0);
        }
    }

    pub(super) fn body_size(&self) -> u64 {
        8 + 4 * self.compatible_brands.len() as u64
    }
}

/// `mvhd`: movie header. Version 1 widens the time fields to 64 bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvhdAtom {
    pub full: FullBox,
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    /// 16.16 fixed point playback rate.
    pub rate: u32,
    /// 8.8 fixed point volume.
    pub volume: u16,
    pub reserved: [u8; 10],
    pub matrix: [u8; 36],
    pub predefined: [u8; 24],
    pub next_track_id: u32,
}

impl MvhdAtom {
    pub(super) fn decode(body: &mut Bytes) -> Result<MvhdAtom, F4vError> {
        let full = FullBox::decode(body, FourCc::MVHD)?;
        let wide = full.version == 1;
        let time_size = if wide { 8 } else { 4 };
        ensure(body, 3 * time_size + 4 + 80, FourCc::MVHD)?;
        let creation_time = if wide { body.get_u64() } else { body.get_u32() as u64 };
        let modification_time = if wide { body.get_u64() } else { body.get_u32() as u64 };
        let timescale = body.get_u32();
        let duration = if wide { body.get_u64() } else { body.get_u32() as u64 };
        let rate = body.get_u32();
        let volume = body.get_u16();
        let mut reserved = [0u8; 10];
        body.copy_to_slice(&mut reserved);
        let mut matrix = [0u8; 36];
        body.copy_to_slice(&mut matrix);
        let mut predefined = [0u8; 24];
        body.copy_to_slice(&mut predefined);
        let next_track_id = body.get_u32();
        Ok(MvhdAtom {
            full,
            creation_time,
            modification_time,
            timescale,
            duration,
            rate,
            volume,
            reserved,
            matrix,
            predefined,
            next_track_id,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        if self.full.version == 1 {
            out.put_u64(self.creation_time);
            out.put_u64(self.modification_time);
            out.put_u32(self.timescale);
            out.put_u64(self.duration);
        } else {
            out.put_u32(self.creation_time as u32);
            out.put_u32(self.modification_time as u32);
            out.put_u32(self.timescale);
            out.put_u32(self.duration as u32);
        }
        out.put_u32(self.rate);
        out.put_u16(self.volume);
        out.put_slice(&self.reserved);
        out.put_slice(&self.matrix);
        out.put_slice(&self.predefined);
        out.put_u32(self.next_track_id);
    }

    pub(super) fn body_size(&self) -> u64 {
        let time_size: u64 = if self.full.version == 1 { 8 } else { 4 };
        4 + 3 * time_size + 4 + 4 + 2 + 10 + 36 + 24 + 4
    }

    pub fn duration_ms(&self) -> i64 {
        if self.timescale == 0 {
            return 0;
        }
        (self.duration as i64).saturating_mul(1000) / self.timescale as i64
    }
}

/// `tkhd`: track header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TkhdAtom {
    pub full: FullBox,
    pub creation_time: u64,
    pub modification_time: u64,
    pub track_id: u32,
    pub reserved1: u32,
    pub duration: u64,
    pub reserved2: [u8; 8],
    pub layer: u16,
    pub alternate_group: u16,
    pub volume: u16,
    pub reserved3: u16,
    pub matrix: [u8; 36],
    /// 16.16 fixed point.
    pub width: u32,
    /// 16.16 fixed point.
    pub height: u32,
}

impl TkhdAtom {
    pub(super) fn decode(body: &mut Bytes) -> Result<TkhdAtom, F4vError> {
        let full = FullBox::decode(body, FourCc::TKHD)?;
        let wide = full.version == 1;
        let time_size = if wide { 8 } else { 4 };
        ensure(body, 3 * time_size + 8 + 60, FourCc::TKHD)?;
        let creation_time = if wide { body.get_u64() } else { body.get_u32() as u64 };
        let modification_time = if wide { body.get_u64() } else { body.get_u32() as u64 };
        let track_id = body.get_u32();
        let reserved1 = body.get_u32();
        let duration = if wide { body.get_u64() } else { body.get_u32() as u64 };
        let mut reserved2 = [0u8; 8];
        body.copy_to_slice(&mut reserved2);
        let layer = body.get_u16();
        let alternate_group = body.get_u16();
        let volume = body.get_u16();
        let reserved3 = body.get_u16();
        let mut matrix = [0u8; 36];
        body.copy_to_slice(&mut matrix);
        let width = body.get_u32();
        let height = body.get_u32();
        Ok(TkhdAtom {
            full,
            creation_time,
            modification_time,
            track_id,
            reserved1,
            duration,
            reserved2,
            layer,
            alternate_group,
            volume,
            reserved3,
            matrix,
            width,
            height,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        if self.full.version == 1 {
            out.put_u64(self.creation_time);
            out.put_u64(self.modification_time);
            out.put_u32(self.track_id);
            out.put_u32(self.reserved1);
            out.put_u64(self.duration);
        } else {
            out.put_u32(self.creation_time as u32);
            out.put_u32(self.modification_time as u32);
            out.put_u32(self.track_id);
            out.put_u32(self.reserved1);
            out.put_u32(self.duration as u32);
        }
        out.put_slice(&self.reserved2);
        out.put_u16(self.layer);
        out.put_u16(self.alternate_group);
        out.put_u16(self.volume);
        out.put_u16(self.reserved3);
        out.put_slice(&self.matrix);
        out.put_u32(self.width);
        out.put_u32(self.height);
    }

    pub(super) fn body_size(&self) -> u64 {
        let time_size: u64 = if self.full.version == 1 { 8 } else { 4 };
        4 + 3 * time_size + 8 + 8 + 2 + 2 + 2 + 2 + 36 + 4 + 4
    }

    /// Integer pixel width (drops the fractional half of the 16.16 field).
    pub fn width_px(&self) -> u32 {
        self.width >> 16
    }

    pub fn height_px(&self) -> u32 {
        self.height >> 16
    }
}

/// `mdhd`: media header carrying the track timescale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdhdAtom {
    pub full: FullBox,
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    /// Packed ISO-639 language code.
    pub language: u16,
    pub quality: u16,
}

impl MdhdAtom {
    pub(super) fn decode(body: &mut Bytes) -> Result<MdhdAtom, F4vError> {
        let full = FullBox::decode(body, FourCc::MDHD)?;
        let wide = full.version == 1;
        let time_size = if wide { 8 } else { 4 };
        ensure(body, 3 * time_size + 4 + 4, FourCc::MDHD)?;
        let creation_time = if wide { body.get_u64() } else { body.get_u32() as u64 };
        let modification_time = if wide { body.get_u64() } else { body.get_u32() as u64 };
        let timescale = body.get_u32();
        let duration = if wide { body.get_u64() } else { body.get_u32() as u64 };
        let language = body.get_u16();
        let quality = body.get_u16();
        Ok(MdhdAtom {
            full,
            creation_time,
            modification_time,
            timescale,
            duration,
            language,
            quality,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        if self.full.version == 1 {
            out.put_u64(self.creation_time);
            out.put_u64(self.modification_time);
            out.put_u32(self.timescale);
            out.put_u64(self.duration);
        } else {
            out.put_u32(self.creation_time as u32);
            out.put_u32(self.modification_time as u32);
            out.put_u32(self.timescale);
            out.put_u32(self.duration as u32);
        }
        out.put_u16(self.language);
        out.put_u16(self.quality);
    }

    pub(super) fn body_size(&self) -> u64 {
        let time_size: u64 = if self.full.version == 1 { 8 } else { 4 };
        4 + 3 * time_size + 4 + 4
    }
}

/// `hdlr`: declares whether the enclosing media is sound or video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdlrAtom {
    pub full: FullBox,
    pub predefined: u32,
    pub handler_type: FourCc,
    pub reserved: [u8; 12],
    /// Handler name, including any trailing NUL the producer wrote.
    pub name: Bytes,
}

pub const HANDLER_SOUND: FourCc = FourCc(*b"soun");
pub const HANDLER_VIDEO: FourCc = FourCc(*b"vide");

impl HdlrAtom {
    pub(super) fn decode(body: &mut Bytes) -> Result<HdlrAtom, F4vError> {
        let full = FullBox::decode(body, FourCc::HDLR)?;
        ensure(body, 20, FourCc::HDLR)?;
        let predefined = body.get_u32();
        let handler_type = FourCc(body.get_u32().to_be_bytes());
        let mut reserved = [0u8; 12];
        body.copy_to_slice(&mut reserved);
        let name = body.split_to(body.len());
        Ok(HdlrAtom {
            full,
            predefined,
            handler_type,
            reserved,
            name,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        out.put_u32(self.predefined);
        out.put_slice(&self.handler_type.0);
        out.put_slice(&self.reserved);
        out.put_slice(&self.name);
    }

    pub(super) fn body_size(&self) -> u64 {
        4 + 20 + self.name.len() as u64
    }

    pub fn is_audio(&self) -> bool {
        self.handler_type == HANDLER_SOUND
    }

    pub fn is_video(&self) -> bool {
        self.handler_type == HANDLER_VIDEO
    }
}

/// `vmhd`: video media header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmhdAtom {
    pub full: FullBox,
    pub graphics_mode: u16,
    pub opcolor: [u16; 3],
}

impl VmhdAtom {
    pub(super) fn decode(body: &mut Bytes) -> Result<VmhdAtom, F4vError> {
        let full = FullBox::decode(body, FourCc::VMHD)?;
        ensure(body, 8, FourCc::VMHD)?;
        let graphics_mode = body.get_u16();
        let opcolor = [body.get_u16(), body.get_u16(), body.get_u16()];
        Ok(VmhdAtom {
            full,
            graphics_mode,
            opcolor,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        out.put_u16(self.graphics_mode);
        for c in self.opcolor {
            out.put_u16(c);
        }
    }

    pub(super) fn body_size(&self) -> u64 {
        4 + 8
    }
}

/// `smhd`: sound media header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmhdAtom {
    pub full: FullBox,
    pub balance: u16,
    pub reserved: u16,
}

impl SmhdAtom {
    pub(super) fn decode(body: &mut Bytes) -> Result<SmhdAtom, F4vError> {
        let full = FullBox::decode(body, FourCc::SMHD)?;
        ensure(body, 4, FourCc::SMHD)?;
        let balance = body.get_u16();
        let reserved = body.get_u16();
        Ok(SmhdAtom {
            full,
            balance,
            reserved,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        out.put_u16(self.balance);
        out.put_u16(self.reserved);
    }

    pub(super) fn body_size(&self) -> u64 {
        4 + 4
    }
}

/// `meta`: a versioned container.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaAtom {
    pub full: FullBox,
    pub children: Vec<Atom>,
}

impl MetaAtom {
    pub(super) fn decode(body: &mut Bytes, position: u64) -> Result<MetaAtom, F4vError> {
        let full = FullBox::decode(body, FourCc::META)?;
        let children = decode_children(body, position + 4)?;
        Ok(MetaAtom { full, children })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        encode_children(&self.children, out);
    }

    pub(super) fn body_size(&self) -> u64 {
        4 + super::children_size(&self.children)
    }
}

/// `mdat` marker. The payload itself never passes through the atom layer:
/// the decoder switches to frame mode and the encoder's caller streams the
/// bytes after the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdatAtom {
    pub data_size: u64,
}
