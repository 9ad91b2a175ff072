//! Movie-level summary extracted from a `moov` atom.

use crate::atom::{AtomBody, ContainerAtom};
use crate::fourcc::FourCc;
use crate::index::{find_trak, trak_stbl};

/// What the container headers say about the streams inside. Consumers map
/// this onto their own media-description types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovieInfo {
    pub has_audio: bool,
    pub has_video: bool,
    pub audio_codec: Option<FourCc>,
    pub video_codec: Option<FourCc>,
    pub audio_channels: u16,
    pub audio_sample_rate: u32,
    pub width: u32,
    pub height: u32,
    pub duration_ms: i64,
}

/// Extract audio and video parameters from `moov`.
pub fn extract_movie_info(moov: &ContainerAtom) -> MovieInfo {
    let mut info = MovieInfo::default();

    if let Some(mvhd) = moov.children.iter().find_map(|a| match &a.body {
        AtomBody::Mvhd(mvhd) => Some(mvhd),
        _ => None,
    }) {
        info.duration_ms = mvhd.duration_ms();
    }

    if let Some(trak) = find_trak(moov, false) {
        info.has_video = true;
        if let Some(tkhd) = trak.children.iter().find_map(|a| match &a.body {
            AtomBody::Tkhd(tkhd) => Some(tkhd),
            _ => None,
        }) {
            info.width = tkhd.width_px();
            info.height = tkhd.height_px();
        }
        if let Some(stbl) = trak_stbl(trak) {
            info.video_codec = first_sample_entry(stbl);
        }
    }

    if let Some(trak) = find_trak(moov, true) {
        info.has_audio = true;
        if let Some(stbl) = trak_stbl(trak) {
            info.audio_codec = first_sample_entry(stbl);
            if let Some(mp4a) = stbl.children.iter().find_map(|a| match &a.body {
                AtomBody::Stsd(stsd) => stsd.entries.iter().find_map(|e| match &e.body {
                    AtomBody::Mp4a(mp4a) => Some(mp4a),
                    _ => None,
                }),
                _ => None,
            }) {
                info.audio_channels = mp4a.channels;
                info.audio_sample_rate = mp4a.sample_rate_hz();
            }
        }
    }

    info
}

fn first_sample_entry(stbl: &ContainerAtom) -> Option<FourCc> {
    stbl.children.iter().find_map(|a| match &a.body {
        AtomBody::Stsd(stsd) => stsd.entries.first().map(|e| e.fourcc()),
        _ => None,
    })
}
