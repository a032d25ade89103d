//! On-wire record frame
//!
//! Every shuffled record travels as one fixed-layout frame, network byte
//! order throughout:
//!
//! ```text
//! u32 src | u32 dst | u8 fname_len | fname | 0x00 | u8 payload_len | payload | u16 epoch
//! ```
//!
//! Both length prefixes are a single byte, so a frame never exceeds
//! 523 bytes. The fixed upper bound lets sender queues and bulk-pull
//! buffers be sized once at init instead of per record.

use crate::error::{Error, Result};
use crate::nexus::Rank;

/// Longest filename the frame can carry
pub const MAX_FNAME: usize = 255;

/// Longest payload the frame can carry
pub const MAX_PAYLOAD: usize = 255;

/// Size of a frame with empty filename and payload
pub const MIN_FRAME: usize = 13;

/// Upper bound on any encoded frame
pub const MAX_FRAME: usize = MIN_FRAME + MAX_FNAME + MAX_PAYLOAD;

/// A decoded frame, borrowing from the receive buffer
///
/// Valid only for the duration of the dispatch call that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Originating rank
    pub src: Rank,

    /// Final destination rank (unchanged across hops)
    pub dst: Rank,

    /// Logical filename, hashed for placement
    pub fname: &'a str,

    /// Record payload
    pub payload: &'a [u8],

    /// Epoch the record belongs to
    pub epoch: u16,
}

/// Exact encoded size of a record
pub fn encoded_len(fname: &str, payload: &[u8]) -> usize {
    MIN_FRAME + fname.len() + payload.len()
}

/// Encode a record into `buf`, returning the written length.
///
/// `buf` must hold at least [`MAX_FRAME`] bytes. Oversize filenames or
/// payloads, and filenames with interior NULs, are caller errors caught
/// before any byte is written.
pub fn encode(
    buf: &mut [u8],
    src: Rank,
    dst: Rank,
    fname: &str,
    payload: &[u8],
    epoch: u16,
) -> Result<usize> {
    if fname.len() > MAX_FNAME {
        return Err(Error::InvalidRecord(format!(
            "filename is {} bytes, max {}",
            fname.len(),
            MAX_FNAME
        )));
    }
    if fname.as_bytes().contains(&0) {
        return Err(Error::InvalidRecord("filename contains NUL".into()));
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::InvalidRecord(format!(
            "payload is {} bytes, max {}",
            payload.len(),
            MAX_PAYLOAD
        )));
    }
    let total = encoded_len(fname, payload);
    if buf.len() < total {
        return Err(Error::InvalidRecord(format!(
            "encode buffer is {} bytes, frame needs {}",
            buf.len(),
            total
        )));
    }

    let mut at = 0;
    buf[at..at + 4].copy_from_slice(&src.to_be_bytes());
    at += 4;
    buf[at..at + 4].copy_from_slice(&dst.to_be_bytes());
    at += 4;
    buf[at] = fname.len() as u8;
    at += 1;
    buf[at..at + fname.len()].copy_from_slice(fname.as_bytes());
    at += fname.len();
    buf[at] = 0;
    at += 1;
    buf[at] = payload.len() as u8;
    at += 1;
    buf[at..at + payload.len()].copy_from_slice(payload);
    at += payload.len();
    buf[at..at + 2].copy_from_slice(&epoch.to_be_bytes());
    at += 2;

    debug_assert_eq!(at, total);
    Ok(at)
}

/// Decode and validate one frame.
///
/// `ctx_src` / `ctx_dst` are the logical pair the RPC fabric carries
/// out-of-band; a frame whose declared ranks disagree with them is
/// corrupt. Trailing bytes after the epoch field are corrupt too: a
/// transport message holds exactly one frame.
pub fn decode(buf: &[u8], ctx_src: Rank, ctx_dst: Rank) -> Result<Frame<'_>> {
    if buf.len() < MIN_FRAME {
        return Err(Error::CorruptFrame(format!(
            "frame is {} bytes, shorter than the {} byte minimum",
            buf.len(),
            MIN_FRAME
        )));
    }

    let src = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let dst = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if src != ctx_src {
        return Err(Error::CorruptFrame(format!(
            "bad src: frame says r{}, fabric says r{}",
            src, ctx_src
        )));
    }
    if dst != ctx_dst {
        return Err(Error::CorruptFrame(format!(
            "bad dst: frame says r{}, fabric says r{}",
            dst, ctx_dst
        )));
    }

    let fname_len = buf[8] as usize;
    let mut at = 9;
    if buf.len() < at + fname_len + 1 {
        return Err(Error::CorruptFrame(
            "filename runs past the end of the frame".into(),
        ));
    }
    let fname_bytes = &buf[at..at + fname_len];
    at += fname_len;
    if buf[at] != 0 {
        return Err(Error::CorruptFrame("missing filename terminator".into()));
    }
    at += 1;
    if fname_bytes.contains(&0) {
        return Err(Error::CorruptFrame("filename contains NUL".into()));
    }
    let fname = std::str::from_utf8(fname_bytes)
        .map_err(|_| Error::CorruptFrame("filename is not UTF-8".into()))?;

    if buf.len() < at + 1 {
        return Err(Error::CorruptFrame("missing payload length".into()));
    }
    let payload_len = buf[at] as usize;
    at += 1;
    if buf.len() < at + payload_len + 2 {
        return Err(Error::CorruptFrame(
            "payload runs past the end of the frame".into(),
        ));
    }
    let payload = &buf[at..at + payload_len];
    at += payload_len;
    let epoch = u16::from_be_bytes([buf[at], buf[at + 1]]);
    at += 2;

    if at != buf.len() {
        return Err(Error::CorruptFrame(format!(
            "{} trailing bytes after the epoch field",
            buf.len() - at
        )));
    }

    Ok(Frame {
        src,
        dst,
        fname,
        payload,
        epoch,
    })
}
