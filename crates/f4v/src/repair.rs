//! Structure repair: move a trailing `moov` in front of `mdat` so the file
//! plays progressively.
//!
//! Only `moov` is re-encoded (its chunk offsets must shift by the exact
//! displacement of the `mdat` payload); every other atom is copied verbatim
//! from the input.

use std::fs;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use tracing::info;

use crate::atom::{Atom, AtomBody, AtomHeader};
use crate::error::F4vError;
use crate::fourcc::FourCc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixResult {
    /// The file already has `moov` before `mdat`; no output was produced
    /// (unless `always_fix` asked for an unconditional pass).
    AlreadyOk,
    Fixed,
}

struct TopLevelAtom {
    header: AtomHeader,
    /// Byte range of the whole atom within the input.
    start: usize,
    end: usize,
}

fn scan_top_level(input: &[u8]) -> Result<Vec<TopLevelAtom>, F4vError> {
    let mut atoms = Vec::new();
    let mut offset = 0usize;
    while offset < input.len() {
        let remaining = &input[offset..];
        let header = AtomHeader::peek(remaining, offset as u64, remaining.len() as u64)?
            .ok_or(F4vError::TruncatedBody {
                fourcc: FourCc::NULL,
                expected: 8,
                got: remaining.len(),
            })?;
        let end = offset + header.size as usize;
        if end > input.len() {
            return Err(F4vError::TruncatedBody {
                fourcc: header.fourcc,
                expected: header.size,
                got: remaining.len(),
            });
        }
        atoms.push(TopLevelAtom {
            header,
            start: offset,
            end,
        });
        offset = end;
    }
    Ok(atoms)
}

fn decode_moov(input: &[u8], atom: &TopLevelAtom) -> Result<Atom, F4vError> {
    let body_start = atom.start + atom.header.header_len as usize;
    let mut body = Bytes::copy_from_slice(&input[body_start..atom.end]);
    Atom::decode(&atom.header, &mut body)
}

/// Shift every `stco`/`co64` entry that points into the old mdat payload
/// range by `delta`.
fn shift_chunk_offsets(moov: &mut Atom, mdat_range: (u64, u64), delta: u64) {
    let (begin, end) = mdat_range;
    match &mut moov.body {
        AtomBody::Stco(table) => {
            for record in &mut table.records {
                let offset = record.offset as u64;
                if offset >= begin && offset < end {
                    record.offset = (offset + delta) as u32;
                }
            }
        }
        AtomBody::Co64(table) => {
            for record in &mut table.records {
                if record.offset >= begin && record.offset < end {
                    record.offset += delta;
                }
            }
        }
        _ => {
            if let Some(children) = moov.children_mut() {
                for child in children {
                    shift_chunk_offsets(child, mdat_range, delta);
                }
            }
        }
    }
}

/// In-memory form of the repair. Returns the fix verdict and, when a fix
/// was performed (or `always_fix` is set), the rewritten file bytes.
pub fn fix_bytes(input: &[u8], always_fix: bool) -> Result<(FixResult, Option<Bytes>), F4vError> {
    let atoms = scan_top_level(input)?;
    let moov_index = atoms.iter().position(|a| a.header.fourcc == FourCc::MOOV);
    let mdat_index = atoms.iter().position(|a| a.header.fourcc == FourCc::MDAT);

    let needs_fix = match (moov_index, mdat_index) {
        (Some(moov), Some(mdat)) => moov > mdat,
        _ => false,
    };
    if !needs_fix {
        if always_fix {
            return Ok((FixResult::AlreadyOk, Some(Bytes::copy_from_slice(input))));
        }
        return Ok((FixResult::AlreadyOk, None));
    }
    let (moov_index, mdat_index) = (moov_index.unwrap(), mdat_index.unwrap());

    let moov_atom = &atoms[moov_index];
    let mdat_atom = &atoms[mdat_index];
    let mdat_data_begin = mdat_atom.start as u64 + mdat_atom.header.header_len as u64;
    let mdat_data_end = mdat_atom.start as u64 + mdat_atom.header.size;

    // Inserting moov in front of mdat displaces the payload by exactly the
    // moov atom's size.
    let delta = moov_atom.header.size;
    let mut moov = decode_moov(input, moov_atom)?;
    shift_chunk_offsets(&mut moov, (mdat_data_begin, mdat_data_end), delta);
    debug_assert_eq!(moov.size(), moov_atom.header.size);

    let mut out = BytesMut::with_capacity(input.len());
    for (i, atom) in atoms.iter().enumerate() {
        if i == moov_index {
            continue;
        }
        if i == mdat_index {
            moov.encode(&mut out);
        }
        out.extend_from_slice(&input[atom.start..atom.end]);
    }
    info!(
        delta,
        moov_size = moov_atom.header.size,
        "moved moov in front of mdat"
    );
    Ok((FixResult::Fixed, Some(out.freeze())))
}

/// File form: reads `input`, writes `output` only when a fix is needed (or
/// `always_fix` requests an unconditional pass).
pub fn fix_file_structure(
    input: &Path,
    output: &Path,
    always_fix: bool,
) -> Result<FixResult, F4vError> {
    let bytes = fs::read(input)?;
    let (result, fixed) = fix_bytes(&bytes, always_fix)?;
    if let Some(fixed) = fixed {
        fs::write(output, &fixed)?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Decoder, F4vData};
    use crate::test_support::build_movie_file;
    use bytes::BytesMut;

    fn frame_payloads(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(data) = decoder.decode(&mut buf).expect("decode") {
            if let F4vData::Frame(frame) = data {
                frames.push(frame.data.to_vec());
            }
        }
        frames
    }

    #[test]
    fn moves_trailing_moov_before_mdat() {
        let broken = build_movie_file(&[10, 20], 40, &[0], false);
        let (result, fixed) = fix_bytes(&broken, false).expect("fix");
        assert_eq!(result, FixResult::Fixed);
        let fixed = fixed.expect("fixed bytes");

        // The fixed file must decode progressively with intact payloads.
        let frames = frame_payloads(&fixed);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].iter().all(|&b| b == 0));
        assert!(frames[1].iter().all(|&b| b == 1));

        // And it must be byte-identical to the natively well-formed layout.
        let good = build_movie_file(&[10, 20], 40, &[0], true);
        assert_eq!(&fixed[..], &good[..]);
    }

    #[test]
    fn chunk_offsets_shift_by_the_mdat_displacement() {
        let broken = build_movie_file(&[10, 20], 40, &[0], false);
        let (_, fixed) = fix_bytes(&broken, false).expect("fix");
        let fixed = fixed.expect("fixed bytes");

        // Locate stco entries in both files through a full decode.
        fn first_chunk_offset(bytes: &[u8]) -> u64 {
            let atoms = scan_top_level(bytes).expect("scan");
            let moov = atoms
                .iter()
                .find(|a| a.header.fourcc == FourCc::MOOV)
                .expect("moov");
            let decoded = decode_moov(bytes, moov).expect("decode moov");
            fn find_stco(atom: &Atom) -> Option<u64> {
                if let AtomBody::Stco(table) = &atom.body {
                    return table.records.first().map(|r| r.offset as u64);
                }
                atom.children()?.iter().find_map(find_stco)
            }
            find_stco(&decoded).expect("stco")
        }

        let atoms = scan_top_level(&broken).expect("scan");
        let moov_size = atoms
            .iter()
            .find(|a| a.header.fourcc == FourCc::MOOV)
            .expect("moov")
            .header
            .size;
        assert_eq!(
            first_chunk_offset(&fixed),
            first_chunk_offset(&broken) + moov_size
        );
    }

    #[test]
    fn repair_is_idempotent() {
        let broken = build_movie_file(&[10, 20], 40, &[0], false);
        let (first, fixed) = fix_bytes(&broken, false).expect("fix");
        assert_eq!(first, FixResult::Fixed);
        let fixed = fixed.expect("fixed bytes");
        let (second, none) = fix_bytes(&fixed, false).expect("second pass");
        assert_eq!(second, FixResult::AlreadyOk);
        assert!(none.is_none());
    }

    #[test]
    fn always_fix_copies_a_good_file() {
        let good = build_movie_file(&[10], 40, &[0], true);
        let (result, copy) = fix_bytes(&good, true).expect("fix");
        assert_eq!(result, FixResult::AlreadyOk);
        assert_eq!(&copy.expect("copy")[..], &good[..]);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("broken.f4v");
        let output = dir.path().join("fixed.f4v");
        std::fs::write(&input, build_movie_file(&[10, 20], 40, &[0], false)).expect("write");

        let result = fix_file_structure(&input, &output, false).expect("fix");
        assert_eq!(result, FixResult::Fixed);
        let fixed = std::fs::read(&output).expect("read");
        assert_eq!(frame_payloads(&fixed).len(), 2);
    }
}
