use bytes::BytesMut;

use crate::atom::Atom;

/// Atom writer. The default form emits compact 32-bit size fields, keeping
/// the extended form only where the decode preserved it or the body demands
/// 64 bits; `force_extended_size` upgrades every header.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder {
    pub force_extended_size: bool,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder::default()
    }

    pub fn encode(&self, atom: &Atom, out: &mut BytesMut) {
        if self.force_extended_size {
            let mut forced = atom.clone();
            forced.set_extended_recursive();
            forced.encode(out);
        } else {
            atom.encode(out);
        }
    }

    /// Size the atom will occupy once encoded.
    pub fn measure(&self, atom: &Atom) -> u64 {
        if self.force_extended_size {
            let mut forced = atom.clone();
            forced.set_extended_recursive();
            forced.size()
        } else {
            atom.size()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{AtomBody, AtomHeader};
    use crate::test_support::{ftyp, video_moov};
    use bytes::Bytes;

    #[test]
    fn encode_matches_measured_size() {
        let atom = ftyp();
        let mut out = BytesMut::new();
        let encoder = Encoder::new();
        encoder.encode(&atom, &mut out);
        assert_eq!(out.len() as u64, encoder.measure(&atom));
    }

    #[test]
    fn forced_extended_headers_round_trip() {
        let moov = Atom::from_body(AtomBody::Moov(video_moov(vec![])));
        let compact_size = moov.size();

        let encoder = Encoder {
            force_extended_size: true,
        };
        let mut out = BytesMut::new();
        encoder.encode(&moov, &mut out);
        assert_eq!(out.len() as u64, encoder.measure(&moov));
        assert!(out.len() as u64 > compact_size);

        // Re-decode and confirm the extended flag survived.
        let header = AtomHeader::peek(&out, 0, out.len() as u64)
            .expect("peek")
            .expect("complete header");
        assert!(header.is_extended());
        let mut body = Bytes::copy_from_slice(&out[header.header_len as usize..]);
        let decoded = Atom::decode(&header, &mut body).expect("decode");
        assert!(decoded.extended);
    }
}
