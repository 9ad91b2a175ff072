//! Sample description atoms: `stsd` and the AVC / AAC sample entries it
//! carries. Sample entries are container-versioned: fixed fields first,
//! then a run of configuration subatoms.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::F4vError;
use crate::fourcc::FourCc;

use super::{Atom, FullBox, children_size, decode_children, encode_children, ensure};

/// `stsd`: entry count plus the sample entry atoms.
#[derive(Debug, Clone, PartialEq)]
pub struct StsdAtom {
    pub full: FullBox,
    pub entries: Vec<Atom>,
}

impl StsdAtom {
    pub(super) fn decode(body: &mut Bytes, position: u64) -> Result<StsdAtom, F4vError> {
        let full = FullBox::decode(body, FourCc::STSD)?;
        ensure(body, 4, FourCc::STSD)?;
        let declared = body.get_u32() as usize;
        let entries = decode_children(body, position + 8)?;
        if entries.len() != declared {
            return Err(F4vError::MalformedAtom {
                fourcc: FourCc::STSD,
                reason: "entry count does not match the decoded entries",
            });
        }
        Ok(StsdAtom { full, entries })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        out.put_u32(self.entries.len() as u32);
        encode_children(&self.entries, out);
    }

    pub(super) fn body_size(&self) -> u64 {
        4 + 4 + children_size(&self.entries)
    }
}

/// `avc1`: visual sample entry; the `avcC` configuration rides in `children`.
#[derive(Debug, Clone, PartialEq)]
pub struct Avc1Atom {
    pub reserved: [u8; 6],
    pub data_reference_index: u16,
    pub predefined1: u16,
    pub reserved1: u16,
    pub predefined2: [u8; 12],
    pub width: u16,
    pub height: u16,
    /// 16.16 fixed point dots per inch.
    pub horizontal_resolution: u32,
    pub vertical_resolution: u32,
    pub reserved2: u32,
    pub frame_count: u16,
    pub compressor_name: [u8; 32],
    pub depth: u16,
    pub predefined3: u16,
    pub children: Vec<Atom>,
}

const VISUAL_SAMPLE_ENTRY_SIZE: usize = 78;

impl Avc1Atom {
    pub(super) fn decode(body: &mut Bytes, position: u64) -> Result<Avc1Atom, F4vError> {
        ensure(body, VISUAL_SAMPLE_ENTRY_SIZE, FourCc::AVC1)?;
        let mut reserved = [0u8; 6];
        body.copy_to_slice(&mut reserved);
        let data_reference_index = body.get_u16();
        let predefined1 = body.get_u16();
        let reserved1 = body.get_u16();
        let mut predefined2 = [0u8; 12];
        body.copy_to_slice(&mut predefined2);
        let width = body.get_u16();
        let height = body.get_u16();
        let horizontal_resolution = body.get_u32();
        let vertical_resolution = body.get_u32();
        let reserved2 = body.get_u32();
        let frame_count = body.get_u16();
        let mut compressor_name = [0u8; 32];
        body.copy_to_slice(&mut compressor_name);
        let depth = body.get_u16();
        let predefined3 = body.get_u16();
        let children = decode_children(body, position + VISUAL_SAMPLE_ENTRY_SIZE as u64)?;
        Ok(Avc1Atom {
            reserved,
            data_reference_index,
            predefined1,
            reserved1,
            predefined2,
            width,
            height,
            horizontal_resolution,
            vertical_resolution,
            reserved2,
            frame_count,
            compressor_name,
            depth,
            predefined3,
            children,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        out.put_slice(&self.reserved);
        out.put_u16(self.data_reference_index);
        out.put_u16(self.predefined1);
        out.put_u16(self.reserved1);
        out.put_slice(&self.predefined2);
        out.put_u16(self.width);
        out.put_u16(self.height);
        out.put_u32(self.horizontal_resolution);
        out.put_u32(self.vertical_resolution);
        out.put_u32(self.reserved2);
        out.put_u16(self.frame_count);
        out.put_slice(&self.compressor_name);
        out.put_u16(self.depth);
        out.put_u16(self.predefined3);
        encode_children(&self.children, out);
    }

    pub(super) fn body_size(&self) -> u64 {
        VISUAL_SAMPLE_ENTRY_SIZE as u64 + children_size(&self.children)
    }
}

/// `avcC`: AVC decoder configuration record.
#[derive(Debug, Clone, PartialEq)]
pub struct AvccAtom {
    pub configuration_version: u8,
    pub profile: u8,
    pub profile_compatibility: u8,
    pub level: u8,
    /// Low two bits of the fifth byte; the rest are reserved ones.
    pub nalu_length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvccAtom {
    pub(super) fn decode(body: &mut Bytes) -> Result<AvccAtom, F4vError> {
        ensure(body, 6, FourCc::AVCC)?;
        let configuration_version = body.get_u8();
        let profile = body.get_u8();
        let profile_compatibility = body.get_u8();
        let level = body.get_u8();
        let nalu_length_size = (body.get_u8() & 0b11) + 1;
        let sps_count = body.get_u8() & 0b1_1111;
        let mut sps = Vec::with_capacity(sps_count as usize);
        for _ in 0..sps_count {
            ensure(body, 2, FourCc::AVCC)?;
            let len = body.get_u16() as usize;
            ensure(body, len, FourCc::AVCC)?;
            sps.push(body.split_to(len));
        }
        ensure(body, 1, FourCc::AVCC)?;
        let pps_count = body.get_u8();
        let mut pps = Vec::with_capacity(pps_count as usize);
        for _ in 0..pps_count {
            ensure(body, 2, FourCc::AVCC)?;
            let len = body.get_u16() as usize;
            ensure(body, len, FourCc::AVCC)?;
            pps.push(body.split_to(len));
        }
        Ok(AvccAtom {
            configuration_version,
            profile,
            profile_compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.configuration_version);
        out.put_u8(self.profile);
        out.put_u8(self.profile_compatibility);
        out.put_u8(self.level);
        out.put_u8(0b1111_1100 | (self.nalu_length_size - 1));
        out.put_u8(0b1110_0000 | self.sps.len() as u8);
        for sps in &self.sps {
            out.put_u16(sps.len() as u16);
            out.put_slice(sps);
        }
        out.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            out.put_u16(pps.len() as u16);
            out.put_slice(pps);
        }
    }

    pub(super) fn body_size(&self) -> u64 {
        let sps: u64 = self.sps.iter().map(|s| 2 + s.len() as u64).sum();
        let pps: u64 = self.pps.iter().map(|p| 2 + p.len() as u64).sum();
        6 + sps + 1 + pps
    }

    /// The raw `AVCDecoderConfigurationRecord` bytes, as carried by FLV
    /// sequence headers.
    pub fn configuration_record(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.body_size() as usize);
        self.encode(&mut out);
        out.freeze()
    }
}

/// `mp4a`: audio sample entry. Version 1 appends the four QuickTime
/// samples-per-packet fields before the subatoms.
#[derive(Debug, Clone, PartialEq)]
pub struct Mp4aAtom {
    pub reserved: [u8; 6],
    pub data_reference_index: u16,
    pub version: u16,
    pub revision: u16,
    pub vendor: u32,
    pub channels: u16,
    pub sample_size: u16,
    pub compression_id: u16,
    pub packet_size: u16,
    /// 16.16 fixed point.
    pub sample_rate: u32,
    pub v1_extension: Option<[u32; 4]>,
    pub children: Vec<Atom>,
}

const AUDIO_SAMPLE_ENTRY_SIZE: usize = 28;

impl Mp4aAtom {
    pub(super) fn decode(body: &mut Bytes, position: u64) -> Result<Mp4aAtom, F4vError> {
        ensure(body, AUDIO_SAMPLE_ENTRY_SIZE, FourCc::MP4A)?;
        let mut reserved = [0u8; 6];
        body.copy_to_slice(&mut reserved);
        let data_reference_index = body.get_u16();
        let version = body.get_u16();
        let revision = body.get_u16();
        let vendor = body.get_u32();
        let channels = body.get_u16();
        let sample_size = body.get_u16();
        let compression_id = body.get_u16();
        let packet_size = body.get_u16();
        let sample_rate = body.get_u32();
        let mut fixed = AUDIO_SAMPLE_ENTRY_SIZE as u64;
        let v1_extension = if version == 1 {
            ensure(body, 16, FourCc::MP4A)?;
            fixed += 16;
            Some([body.get_u32(), body.get_u32(), body.get_u32(), body.get_u32()])
        } else {
            None
        };
        let children = decode_children(body, position + fixed)?;
        Ok(Mp4aAtom {
            reserved,
            data_reference_index,
            version,
            revision,
            vendor,
            channels,
            sample_size,
            compression_id,
            packet_size,
            sample_rate,
            v1_extension,
            children,
        })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        out.put_slice(&self.reserved);
        out.put_u16(self.data_reference_index);
        out.put_u16(self.version);
        out.put_u16(self.revision);
        out.put_u32(self.vendor);
        out.put_u16(self.channels);
        out.put_u16(self.sample_size);
        out.put_u16(self.compression_id);
        out.put_u16(self.packet_size);
        out.put_u32(self.sample_rate);
        if let Some(ext) = self.v1_extension {
            for word in ext {
                out.put_u32(word);
            }
        }
        encode_children(&self.children, out);
    }

    pub(super) fn body_size(&self) -> u64 {
        let ext = if self.v1_extension.is_some() { 16 } else { 0 };
        AUDIO_SAMPLE_ENTRY_SIZE as u64 + ext + children_size(&self.children)
    }

    /// Integer sample rate (drops the 16.16 fraction).
    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate >> 16
    }
}

/// `esds`: elementary stream descriptor, kept opaque. The descriptor is a
/// nested tag-length structure whose contents this crate never interprets;
/// byte preservation is what matters.
#[derive(Debug, Clone, PartialEq)]
pub struct EsdsAtom {
    pub full: FullBox,
    pub descriptor: Bytes,
}

impl EsdsAtom {
    pub(super) fn decode(body: &mut Bytes) -> Result<EsdsAtom, F4vError> {
        let full = FullBox::decode(body, FourCc::ESDS)?;
        let descriptor = body.split_to(body.len());
        Ok(EsdsAtom { full, descriptor })
    }

    pub(super) fn encode(&self, out: &mut BytesMut) {
        self.full.encode(out);
        out.put_slice(&self.descriptor);
    }

    pub(super) fn body_size(&self) -> u64 {
        4 + self.descriptor.len() as u64
    }
}
