use thiserror::Error;

use crate::fourcc::FourCc;

#[derive(Error, Debug)]
pub enum F4vError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("atom {fourcc} advertises size {size}, smaller than its own header")]
    AtomSizeTooSmall { fourcc: FourCc, size: u64 },
    #[error("atom {fourcc} body truncated: expected {expected} bytes, got {got}")]
    TruncatedBody {
        fourcc: FourCc,
        expected: u64,
        got: usize,
    },
    #[error("malformed {fourcc} atom: {reason}")]
    MalformedAtom {
        fourcc: FourCc,
        reason: &'static str,
    },
    #[error("found mdat with no previous moov")]
    MdatBeforeMoov,
    #[error("cannot read an atom while frames remain in the current mdat")]
    FramesPending,
    #[error("frame cache exceeded {0} entries; sample index inconsistent with mdat bytes")]
    FrameCacheOverflow(usize),
    #[error("seek target out of range: frame {frame} of {count}")]
    SeekOutOfRange { frame: u32, count: usize },
    #[error("seek is only possible in frame reading mode")]
    SeekNotInFrameMode,
}
