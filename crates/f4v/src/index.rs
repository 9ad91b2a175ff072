//! Builds the frame index for an `mdat` from the sample tables of the last
//! seen `moov`: per-frame offsets, sizes, timestamps and keyframe flags,
//! merged across the audio and video tracks.

use crate::atom::{Atom, AtomBody, ContainerAtom, MdhdAtom, StszAtom};
use crate::fourcc::FourCc;
use crate::frame::{FrameHeader, FrameKind};

/// The audio or video `trak` container of a movie.
pub fn find_trak(moov: &ContainerAtom, audio: bool) -> Option<&ContainerAtom> {
    moov.children.iter().find_map(|child| {
        let AtomBody::Trak(trak) = &child.body else {
            return None;
        };
        let mdia = container_child(trak, FourCc::MDIA)?;
        let hdlr = mdia.children.iter().find_map(|a| match &a.body {
            AtomBody::Hdlr(hdlr) => Some(hdlr),
            _ => None,
        })?;
        let matches = if audio { hdlr.is_audio() } else { hdlr.is_video() };
        matches.then_some(trak)
    })
}

fn container_child<'a>(parent: &'a ContainerAtom, fourcc: FourCc) -> Option<&'a ContainerAtom> {
    parent.children.iter().find_map(|a| {
        if a.fourcc() != fourcc {
            return None;
        }
        match &a.body {
            AtomBody::Trak(c)
            | AtomBody::Mdia(c)
            | AtomBody::Minf(c)
            | AtomBody::Stbl(c)
            | AtomBody::Moov(c) => Some(c),
            _ => None,
        }
    })
}

pub fn trak_mdhd(trak: &ContainerAtom) -> Option<&MdhdAtom> {
    let mdia = container_child(trak, FourCc::MDIA)?;
    mdia.children.iter().find_map(|a| match &a.body {
        AtomBody::Mdhd(mdhd) => Some(mdhd),
        _ => None,
    })
}

pub fn trak_stbl(trak: &ContainerAtom) -> Option<&ContainerAtom> {
    let mdia = container_child(trak, FourCc::MDIA)?;
    let minf = container_child(mdia, FourCc::MINF)?;
    container_child(minf, FourCc::STBL)
}

/// Track timescale in units per second; 1 when the track is absent, so time
/// math stays divide-safe.
pub fn timescale(moov: &ContainerAtom, audio: bool) -> u64 {
    find_trak(moov, audio)
        .and_then(trak_mdhd)
        .map(|mdhd| mdhd.timescale as u64)
        .filter(|&scale| scale != 0)
        .unwrap_or(1)
}

struct SampleTables<'a> {
    stts: &'a [crate::atom::TimeToSampleRecord],
    ctts: &'a [crate::atom::CompositionOffsetRecord],
    stss: Option<&'a [crate::atom::SyncSampleRecord]>,
    stsc: &'a [crate::atom::SampleToChunkRecord],
    stsz: &'a StszAtom,
    chunk_offsets: Vec<u64>,
}

fn sample_tables(stbl: &ContainerAtom) -> Option<SampleTables<'_>> {
    let mut stts = None;
    let mut ctts: &[crate::atom::CompositionOffsetRecord] = &[];
    let mut stss = None;
    let mut stsc = None;
    let mut stsz = None;
    let mut chunk_offsets = Vec::new();
    for Atom { body, .. } in &stbl.children {
        match body {
            AtomBody::Stts(t) => stts = Some(t.records.as_slice()),
            AtomBody::Ctts(t) => ctts = t.records.as_slice(),
            AtomBody::Stss(t) => stss = Some(t.records.as_slice()),
            AtomBody::Stsc(t) => stsc = Some(t.records.as_slice()),
            AtomBody::Stsz(t) => stsz = Some(t),
            AtomBody::Stco(t) => {
                chunk_offsets = t.records.iter().map(|r| r.offset as u64).collect();
            }
            AtomBody::Co64(t) => {
                chunk_offsets = t.records.iter().map(|r| r.offset).collect();
            }
            _ => {}
        }
    }
    Some(SampleTables {
        stts: stts?,
        ctts,
        stss,
        stsc: stsc?,
        stsz: stsz?,
        chunk_offsets,
    })
}

/// Walk one track's sample tables and emit a frame header per sample.
pub fn extract_frames(moov: &ContainerAtom, audio: bool, out: &mut Vec<FrameHeader>) {
    let Some(trak) = find_trak(moov, audio) else {
        return;
    };
    let Some(stbl) = trak_stbl(trak) else {
        return;
    };
    let Some(tables) = sample_tables(stbl) else {
        return;
    };
    let scale = timescale(moov, audio);
    let kind = if audio { FrameKind::Audio } else { FrameKind::Video };
    let total_samples = tables.stsz.sample_count;

    // Expand the time-to-sample and composition-offset runs lazily.
    let mut stts_iter = tables.stts.iter();
    let mut stts_run = stts_iter.next();
    let mut stts_left = stts_run.map(|r| r.sample_count).unwrap_or(0);
    let mut ctts_iter = tables.ctts.iter();
    let mut ctts_run = ctts_iter.next();
    let mut ctts_left = ctts_run.map(|r| r.sample_count).unwrap_or(0);

    // Keyframes: explicit stss, or every video sample when absent.
    let keyframe = |sample_index: u32| -> bool {
        match (kind, tables.stss) {
            (FrameKind::Audio, _) => false,
            (_, Some(stss)) => stss
                .binary_search_by_key(&(sample_index + 1), |r| r.sample_number)
                .is_ok(),
            (_, None) => true,
        }
    };

    let mut dts: u64 = 0;
    let mut sample_index: u32 = 0;
    let chunk_count = tables.chunk_offsets.len() as u32;

    'chunks: for chunk_number in 1..=chunk_count {
        // stsc runs: the record with the largest first_chunk <= chunk_number.
        let samples_per_chunk = tables
            .stsc
            .iter()
            .take_while(|r| r.first_chunk <= chunk_number)
            .last()
            .map(|r| r.samples_per_chunk)
            .unwrap_or(0);
        let mut offset = tables.chunk_offsets[chunk_number as usize - 1];

        for _ in 0..samples_per_chunk {
            if sample_index >= total_samples {
                break 'chunks;
            }
            let size = tables.stsz.size_of(sample_index) as u64;

            let delta = stts_run.map(|r| r.sample_delta).unwrap_or(0) as u64;
            let composition_offset = ctts_run.map(|r| r.composition_offset).unwrap_or(0) as u64;

            out.push(FrameHeader {
                offset,
                size,
                decoding_ts_ms: (dts.saturating_mul(1000) / scale) as i64,
                composition_ts_ms: ((dts + composition_offset).saturating_mul(1000) / scale)
                    as i64,
                duration_ms: (delta.saturating_mul(1000) / scale) as i64,
                sample_index,
                kind,
                is_keyframe: keyframe(sample_index),
            });

            offset += size;
            dts += delta;
            sample_index += 1;
            if stts_left > 0 {
                stts_left -= 1;
                if stts_left == 0 {
                    stts_run = stts_iter.next();
                    stts_left = stts_run.map(|r| r.sample_count).unwrap_or(0);
                }
            }
            if ctts_left > 0 {
                ctts_left -= 1;
                if ctts_left == 0 {
                    ctts_run = ctts_iter.next();
                    ctts_left = ctts_run.map(|r| r.sample_count).unwrap_or(0);
                }
            }
        }
    }
}

/// Audio and video frames of the movie merged into one list ordered by file
/// offset; the order the bytes will be met inside `mdat`.
pub fn merged_frames(moov: &ContainerAtom) -> Vec<FrameHeader> {
    let mut audio = Vec::new();
    extract_frames(moov, true, &mut audio);
    let mut video = Vec::new();
    extract_frames(moov, false, &mut video);

    let mut merged = Vec::with_capacity(audio.len() + video.len());
    let (mut a, mut v) = (audio.into_iter().peekable(), video.into_iter().peekable());
    loop {
        let take_audio = match (a.peek(), v.peek()) {
            (Some(fa), Some(fv)) => fa.offset < fv.offset,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_audio { a.next() } else { v.next() };
        merged.push(next.expect("peeked frame vanished"));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{
        ChunkOffsetRecord, RecordTable, SampleToChunkRecord, SyncSampleRecord,
        TimeToSampleRecord,
    };
    use crate::test_support::{stbl_atoms, video_moov};

    #[test]
    fn extracts_offsets_and_timestamps() {
        // 4 video samples of 100 bytes, 1000-unit deltas at timescale 1000,
        // two chunks of two samples at offsets 64 and 1000.
        let moov = video_moov(stbl_atoms(
            RecordTable::<TimeToSampleRecord>::new(vec![TimeToSampleRecord {
                sample_count: 4,
                sample_delta: 1000,
            }]),
            Some(RecordTable::<SyncSampleRecord>::new(vec![
                SyncSampleRecord { sample_number: 1 },
                SyncSampleRecord { sample_number: 3 },
            ])),
            RecordTable::<SampleToChunkRecord>::new(vec![SampleToChunkRecord {
                first_chunk: 1,
                samples_per_chunk: 2,
                sample_description_id: 1,
            }]),
            StszAtom {
                full: Default::default(),
                sample_size: 100,
                sample_count: 4,
                sizes: vec![],
            },
            RecordTable::<ChunkOffsetRecord>::new(vec![
                ChunkOffsetRecord { offset: 64 },
                ChunkOffsetRecord { offset: 1000 },
            ]),
        ));

        let mut frames = Vec::new();
        extract_frames(&moov, false, &mut frames);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].offset, 64);
        assert_eq!(frames[1].offset, 164);
        assert_eq!(frames[2].offset, 1000);
        assert_eq!(frames[3].offset, 1100);
        assert_eq!(frames[0].decoding_ts_ms, 0);
        assert_eq!(frames[1].decoding_ts_ms, 1000);
        assert_eq!(frames[3].decoding_ts_ms, 3000);
        assert!(frames[0].is_keyframe);
        assert!(!frames[1].is_keyframe);
        assert!(frames[2].is_keyframe);
        assert!(!frames[3].is_keyframe);
    }
}
