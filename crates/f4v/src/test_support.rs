//! Builders for synthetic movies, shared by unit tests, integration tests
//! and downstream crates' test suites.

use bytes::{BufMut, Bytes, BytesMut};

use crate::atom::{
    Atom, AtomBody, ChunkOffsetRecord, ContainerAtom, FtypAtom, FullBox, HdlrAtom, MdatAtom,
    MdhdAtom, MvhdAtom, RecordTable, SampleToChunkRecord, StsdAtom, StszAtom, SyncSampleRecord,
    TimeToSampleRecord,
};
use crate::fourcc::FourCc;

/// A `hdlr` for the requested handler type.
pub fn hdlr(handler: FourCc) -> Atom {
    Atom::from_body(AtomBody::Hdlr(HdlrAtom {
        full: FullBox::default(),
        predefined: 0,
        handler_type: handler,
        reserved: [0; 12],
        name: Bytes::from_static(b"handler\0"),
    }))
}

/// A version-0 `mdhd` with the given timescale.
pub fn mdhd(timescale: u32, duration: u32) -> Atom {
    Atom::from_body(AtomBody::Mdhd(MdhdAtom {
        full: FullBox::default(),
        creation_time: 0,
        modification_time: 0,
        timescale,
        duration: duration as u64,
        language: 0x55c4,
        quality: 0,
    }))
}

/// A version-0 `mvhd`.
pub fn mvhd(timescale: u32, duration: u32) -> Atom {
    Atom::from_body(AtomBody::Mvhd(MvhdAtom {
        full: FullBox::default(),
        creation_time: 0,
        modification_time: 0,
        timescale,
        duration: duration as u64,
        rate: 0x0001_0000,
        volume: 0x0100,
        reserved: [0; 10],
        matrix: [0; 36],
        predefined: [0; 24],
        next_track_id: 2,
    }))
}

/// Wrap sample-table atoms into `trak { mdia { hdlr, mdhd, minf { stbl } } }`.
fn trak(handler: FourCc, timescale: u32, stbl_children: Vec<Atom>) -> Atom {
    let stbl = Atom::from_body(AtomBody::Stbl(ContainerAtom {
        children: stbl_children,
    }));
    let minf = Atom::from_body(AtomBody::Minf(ContainerAtom {
        children: vec![stbl],
    }));
    let mdia = Atom::from_body(AtomBody::Mdia(ContainerAtom {
        children: vec![hdlr(handler), mdhd(timescale, 0), minf],
    }));
    Atom::from_body(AtomBody::Trak(ContainerAtom {
        children: vec![mdia],
    }))
}

/// The usual five sample tables for a video track.
pub fn stbl_atoms(
    stts: RecordTable<TimeToSampleRecord>,
    stss: Option<RecordTable<SyncSampleRecord>>,
    stsc: RecordTable<SampleToChunkRecord>,
    stsz: StszAtom,
    stco: RecordTable<ChunkOffsetRecord>,
) -> Vec<Atom> {
    let mut children = vec![
        Atom::from_body(AtomBody::Stsd(StsdAtom {
            full: FullBox::default(),
            entries: vec![],
        })),
        Atom::from_body(AtomBody::Stts(stts)),
    ];
    if let Some(stss) = stss {
        children.push(Atom::from_body(AtomBody::Stss(stss)));
    }
    children.push(Atom::from_body(AtomBody::Stsc(stsc)));
    children.push(Atom::from_body(AtomBody::Stsz(stsz)));
    children.push(Atom::from_body(AtomBody::Stco(stco)));
    children
}

/// A moov container holding one video track (timescale 1000) around the
/// given sample tables.
pub fn video_moov(stbl_children: Vec<Atom>) -> ContainerAtom {
    ContainerAtom {
        children: vec![
            mvhd(1000, 0),
            trak(FourCc(*b"vide"), 1000, stbl_children),
        ],
    }
}

pub fn ftyp() -> Atom {
    Atom::from_body(AtomBody::Ftyp(FtypAtom {
        major_brand: FourCc(*b"f4v "),
        minor_version: 0,
        compatible_brands: vec![FourCc(*b"isom"), FourCc(*b"mp42")],
    }))
}

/// A complete coherent movie file.
///
/// One video track at timescale 1000 (deltas are milliseconds), all samples
/// in a single chunk placed directly after the `mdat` header. `keyframes`
/// lists 0-based sample indices. Sample `i`'s payload is `sample_sizes[i]`
/// bytes of the value `i as u8`.
///
/// Layout is `ftyp moov mdat` when `moov_first`, `ftyp mdat moov` otherwise
/// (the broken shape [`crate::repair`] exists to fix); chunk offsets are
/// correct for whichever layout is produced.
pub fn build_movie_file(
    sample_sizes: &[u32],
    delta_ms: u32,
    keyframes: &[u32],
    moov_first: bool,
) -> Bytes {
    let n = sample_sizes.len() as u32;
    let stts = RecordTable::new(vec![TimeToSampleRecord {
        sample_count: n,
        sample_delta: delta_ms,
    }]);
    let stss = (!keyframes.is_empty()).then(|| {
        RecordTable::new(
            keyframes
                .iter()
                .map(|&i| SyncSampleRecord { sample_number: i + 1 })
                .collect(),
        )
    });
    let stsc = RecordTable::new(vec![SampleToChunkRecord {
        first_chunk: 1,
        samples_per_chunk: n,
        sample_description_id: 1,
    }]);
    let stsz = StszAtom {
        full: FullBox::default(),
        sample_size: 0,
        sample_count: n,
        sizes: sample_sizes.to_vec(),
    };
    // Offset fixed after the surrounding sizes are known.
    let stco = RecordTable::new(vec![ChunkOffsetRecord { offset: 0 }]);

    let ftyp = ftyp();
    let mut moov_container = video_moov(stbl_atoms(stts, stss, stsc, stsz, stco));

    let data_size: u64 = sample_sizes.iter().map(|&s| s as u64).sum();
    let moov_size = Atom::from_body(AtomBody::Moov(moov_container.clone())).size();
    let mdat_header = 8u64;
    let data_start = if moov_first {
        ftyp.size() + moov_size + mdat_header
    } else {
        ftyp.size() + mdat_header
    };
    set_chunk_offset(&mut moov_container, data_start as u32);
    let moov = Atom::from_body(AtomBody::Moov(moov_container));

    let mdat = Atom::from_body(AtomBody::Mdat(MdatAtom { data_size }));

    let mut out = BytesMut::new();
    ftyp.encode(&mut out);
    if moov_first {
        moov.encode(&mut out);
    }
    mdat.encode(&mut out);
    for (i, &size) in sample_sizes.iter().enumerate() {
        out.put_bytes(i as u8, size as usize);
    }
    if !moov_first {
        moov.encode(&mut out);
    }
    out.freeze()
}

fn set_chunk_offset(moov: &mut ContainerAtom, offset: u32) {
    fn walk(atoms: &mut [Atom], offset: u32) {
        for atom in atoms {
            match &mut atom.body {
                AtomBody::Stco(table) => {
                    for record in &mut table.records {
                        record.offset = offset;
                    }
                }
                AtomBody::Trak(c) | AtomBody::Mdia(c) | AtomBody::Minf(c) | AtomBody::Stbl(c) => {
                    walk(&mut c.children, offset)
                }
                _ => {}
            }
        }
    }
    walk(&mut moov.children, offset);
}
