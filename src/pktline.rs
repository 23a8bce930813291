//! Git pkt-line wire framing: `NNNN<payload>`, where `NNNN` is a 4-digit ASCII
//! hex length of the whole frame (header included). Three lengths are special
//! and carry no payload: `0000` (flush), `0001` (delimiter), `0002`
//! (response-end). Lengths in `0003..0004` are invalid: a real payload is at
//! least one byte, so the smallest non-special frame is `0005x`.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Side-band channel a data packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Data = 1,
    Progress = 2,
    Error = 3,
}

/// A single parsed pkt-line frame.
#[derive(Clone, PartialEq, Eq)]
pub enum Packet {
    Flush,
    Delim,
    ResponseEnd,
    Data(Vec<u8>),
}

impl Packet {
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Packet::Data(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PktLineError {
    #[error("malformed pkt-line header: {0:?}")]
    MalformedHeader(Vec<u8>),
    #[error("pkt-line length {len} exceeds remaining buffer of {remaining} bytes")]
    LengthExceedsBuffer { len: usize, remaining: usize },
    #[error("stream ended before a terminating flush packet")]
    TruncatedStream,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const FLUSH_LEN: usize = 0;
const DELIM_LEN: usize = 1;
const RESPONSE_END_LEN: usize = 2;

fn parse_header(header: &[u8; 4]) -> Result<usize, PktLineError> {
    let s = std::str::from_utf8(header).map_err(|_| PktLineError::MalformedHeader(header.to_vec()))?;
    usize::from_str_radix(s, 16).map_err(|_| PktLineError::MalformedHeader(header.to_vec()))
}

/// Encode a single frame. `channel`, if given, is prepended to `payload` as a
/// single side-band channel byte before the length is computed.
pub fn encode(payload: &[u8], channel: Option<Channel>) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 1);
    if let Some(c) = channel {
        body.push(c as u8);
    }
    body.extend_from_slice(payload);
    let total = body.len() + 4;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(format!("{total:04x}").as_bytes());
    out.extend_from_slice(&body);
    out
}

/// Encode the flush packet `0000`.
pub fn flush() -> Vec<u8> {
    b"0000".to_vec()
}

/// Encode the delimiter packet `0001`.
pub fn delim() -> Vec<u8> {
    b"0001".to_vec()
}

/// Parse a complete in-memory buffer into its constituent frames.
///
/// Pure, synchronous, and total over the buffer: it does not stop at the
/// first flush, since higher-level parsers need to see the full sequence
/// including a trailing flush used as a terminator.
pub fn parse_buffer(mut buf: &[u8]) -> Result<Vec<Packet>, PktLineError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 4 {
            return Err(PktLineError::MalformedHeader(buf.to_vec()));
        }
        let header: [u8; 4] = buf[..4].try_into().unwrap();
        let len = parse_header(&header)?;
        buf = &buf[4..];
        match len {
            FLUSH_LEN => out.push(Packet::Flush),
            DELIM_LEN => out.push(Packet::Delim),
            RESPONSE_END_LEN => out.push(Packet::ResponseEnd),
            1..=3 => return Err(PktLineError::MalformedHeader(header.to_vec())),
            _ => {
                let payload_len = len - 4;
                if payload_len > buf.len() {
                    return Err(PktLineError::LengthExceedsBuffer {
                        len: payload_len,
                        remaining: buf.len(),
                    });
                }
                out.push(Packet::Data(buf[..payload_len].to_vec()));
                buf = &buf[payload_len..];
            }
        }
    }
    Ok(out)
}

/// Text inserted in place of the first dropped side-band-2 (progress) packet
/// of a served cache entry, so the client sees *some* indication that the
/// pack came from a local cache rather than a fresh server-side compression.
pub const CACHE_MARKER_TEXT: &[u8] = b"git-cdn, using cached pack\n";

/// Streaming pkt-line reader over an `AsyncRead` source that filters
/// side-band-2 (progress) frames: every progress frame after the first is
/// dropped outright, and the first one is replaced by a synthetic marker
/// frame carrying [`CACHE_MARKER_TEXT`]. All other frames pass through
/// unchanged. Used both to populate the pack cache and, conceptually, by
/// anything that needs to re-stream a cached entry.
pub struct ChunkFilter<R> {
    reader: R,
    seen_progress: bool,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkFilter<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            seen_progress: false,
            done: false,
        }
    }

    /// Read and filter the next frame. Returns `Ok(None)` once the
    /// terminating flush has been consumed and yielded; returns
    /// `Err(TruncatedStream)` if the underlying reader hits EOF first.
    ///
    /// The returned bytes are the raw encoded frame (header + payload),
    /// ready to be written verbatim to a sink.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, PktLineError> {
        if self.done {
            return Ok(None);
        }
        loop {
            let mut header = [0u8; 4];
            match self.reader.read_exact(&mut header).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(PktLineError::TruncatedStream);
                }
                Err(e) => return Err(e.into()),
            }
            let len = parse_header(&header)?;
            match len {
                FLUSH_LEN => {
                    self.done = true;
                    return Ok(Some(flush()));
                }
                DELIM_LEN => return Ok(Some(delim())),
                RESPONSE_END_LEN => {
                    let mut out = Vec::with_capacity(4);
                    out.extend_from_slice(b"0002");
                    return Ok(Some(out));
                }
                1..=3 => return Err(PktLineError::MalformedHeader(header.to_vec())),
                _ => {
                    let payload_len = len - 4;
                    let mut payload = vec![0u8; payload_len];
                    self.reader.read_exact(&mut payload).await.map_err(|e| {
                        if e.kind() == std::io::ErrorKind::UnexpectedEof {
                            PktLineError::TruncatedStream
                        } else {
                            PktLineError::Io(e)
                        }
                    })?;
                    if payload.first() == Some(&(Channel::Progress as u8)) {
                        if self.seen_progress {
                            // drop subsequent progress frames entirely
                            continue;
                        }
                        self.seen_progress = true;
                        return Ok(Some(encode(CACHE_MARKER_TEXT, Some(Channel::Progress))));
                    }
                    let mut out = header.to_vec();
                    out.extend_from_slice(&payload);
                    return Ok(Some(out));
                }
            }
        }
    }
}

impl fmt::Debug for Packet {
    // Implemented manually only to keep binary payloads readable in test
    // failure output (derive would print raw bytes as a Vec<u8> debug list).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Flush => write!(f, "Flush"),
            Packet::Delim => write!(f, "Delim"),
            Packet::ResponseEnd => write!(f, "ResponseEnd"),
            Packet::Data(d) => write!(f, "Data({:?})", String::from_utf8_lossy(d)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_plain_payload() {
        assert_eq!(encode(b"done\n", None), b"0009done\n");
    }

    #[test]
    fn encode_with_channel() {
        let out = encode(b"NAK\n", Some(Channel::Data));
        assert_eq!(out, b"0009\x01NAK\n");
    }

    #[test]
    fn parse_buffer_round_trip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode(b"want abc\n", None));
        buf.extend_from_slice(&flush());
        let packets = parse_buffer(&buf).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].as_data(), Some(&b"want abc\n"[..]));
        assert_eq!(packets[1], Packet::Flush);
    }

    #[test]
    fn parse_buffer_rejects_short_header_length() {
        // header claims 3 bytes total, which is an invalid (too-small) length
        let err = parse_buffer(b"0003").unwrap_err();
        assert!(matches!(err, PktLineError::MalformedHeader(_)));
    }

    #[test]
    fn parse_buffer_rejects_length_exceeding_remaining() {
        // header says 0x20 (32) bytes total i.e. 28 payload bytes, but there are only 3
        let mut buf = b"0020".to_vec();
        buf.extend_from_slice(b"abc");
        let err = parse_buffer(&buf).unwrap_err();
        assert!(matches!(err, PktLineError::LengthExceedsBuffer { .. }));
    }

    #[tokio::test]
    async fn chunk_filter_passes_through_non_progress() {
        let mut input = Vec::new();
        input.extend_from_slice(&encode(b"NAK\n", Some(Channel::Data)));
        input.extend_from_slice(&flush());
        let mut filter = ChunkFilter::new(&input[..]);
        let first = filter.next_frame().await.unwrap().unwrap();
        assert_eq!(first, encode(b"NAK\n", Some(Channel::Data)));
        let second = filter.next_frame().await.unwrap().unwrap();
        assert_eq!(second, flush());
        assert!(filter.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunk_filter_replaces_first_progress_and_drops_rest() {
        let mut input = Vec::new();
        input.extend_from_slice(&encode(b"compressing\n", Some(Channel::Progress)));
        input.extend_from_slice(&encode(b"counting\n", Some(Channel::Progress)));
        input.extend_from_slice(&encode(b"pack\n", Some(Channel::Data)));
        input.extend_from_slice(&flush());
        let mut filter = ChunkFilter::new(&input[..]);

        let first = filter.next_frame().await.unwrap().unwrap();
        assert_eq!(first, encode(CACHE_MARKER_TEXT, Some(Channel::Progress)));

        let second = filter.next_frame().await.unwrap().unwrap();
        assert_eq!(second, encode(b"pack\n", Some(Channel::Data)));

        let third = filter.next_frame().await.unwrap().unwrap();
        assert_eq!(third, flush());
    }

    #[tokio::test]
    async fn chunk_filter_fails_on_truncated_stream() {
        let input = encode(b"want abc\n", None);
        // drop the flush terminator entirely
        let mut filter = ChunkFilter::new(&input[..]);
        let _ = filter.next_frame().await.unwrap();
        let err = filter.next_frame().await.unwrap_err();
        assert!(matches!(err, PktLineError::TruncatedStream));
    }
}
