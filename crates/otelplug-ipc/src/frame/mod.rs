//! Length-prefixed frame codec.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! +-----------+------+------------+---------------+
//! | stream u32| kind | length u32 | payload bytes |
//! +-----------+------+------------+---------------+
//! ```
//!
//! A [`FrameKind::Mapped`] frame carries no payload bytes on the socket; its
//! length field counts bytes the sender placed in the shared-memory region.
//!
//! Payloads above [`MAX_FRAME_LEN`] are rejected on both the write and the
//! read side; nothing is ever truncated.

use std::io::{self, Read, Write};

use crate::error::TransportError;

/// Largest accepted payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 9;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Carries one encoded message.
    Data,
    /// Abandons the stream.
    Reset,
    /// Announces one encoded message waiting in the shared-memory region.
    Mapped,
}

impl FrameKind {
    const fn as_byte(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Reset => 1,
            Self::Mapped => 2,
        }
    }

    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Data),
            1 => Some(Self::Reset),
            2 => Some(Self::Mapped),
            _ => None,
        }
    }
}

/// A single unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    stream: u32,
    kind: FrameKind,
    payload: Vec<u8>,
    mapped: usize,
}

impl Frame {
    /// Builds a data frame.
    #[must_use]
    pub const fn data(stream: u32, payload: Vec<u8>) -> Self {
        Self {
            stream,
            kind: FrameKind::Data,
            payload,
            mapped: 0,
        }
    }

    /// Builds a reset frame.
    #[must_use]
    pub const fn reset(stream: u32) -> Self {
        Self {
            stream,
            kind: FrameKind::Reset,
            payload: Vec::new(),
            mapped: 0,
        }
    }

    /// Builds a doorbell for `len` bytes pushed into the shared-memory
    /// region.
    #[must_use]
    pub const fn mapped(stream: u32, len: usize) -> Self {
        Self {
            stream,
            kind: FrameKind::Mapped,
            payload: Vec::new(),
            mapped: len,
        }
    }

    /// Stream the frame belongs to.
    #[must_use]
    pub const fn stream(&self) -> u32 {
        self.stream
    }

    /// Frame kind.
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bytes waiting in the shared-memory region; zero unless the frame is
    /// [`FrameKind::Mapped`].
    #[must_use]
    pub const fn mapped_len(&self) -> usize {
        self.mapped
    }

    /// Consumes the frame, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serialises the frame into `writer` with a single `write_all`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), TransportError> {
        let len = match self.kind {
            FrameKind::Mapped => self.mapped,
            FrameKind::Data | FrameKind::Reset => self.payload.len(),
        };
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        let encoded_len = u32::try_from(len).map_err(|_| TransportError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        })?;

        let mut buffer = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buffer.extend_from_slice(&self.stream.to_be_bytes());
        buffer.push(self.kind.as_byte());
        buffer.extend_from_slice(&encoded_len.to_be_bytes());
        buffer.extend_from_slice(&self.payload);
        writer
            .write_all(&buffer)
            .and_then(|()| writer.flush())
            .map_err(|source| TransportError::io("writing frame", source))
    }

    /// Reads the next frame; `Ok(None)` on a clean end of stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>, TransportError> {
        let Some(header) = read_header(reader)? else {
            return Ok(None);
        };
        let [s0, s1, s2, s3, kind, l0, l1, l2, l3] = header;
        let stream = u32::from_be_bytes([s0, s1, s2, s3]);
        let kind = FrameKind::from_byte(kind).ok_or_else(|| TransportError::MalformedFrame {
            message: format!("unknown frame kind {kind}"),
        })?;
        let len = usize::try_from(u32::from_be_bytes([l0, l1, l2, l3])).unwrap_or(usize::MAX);
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if kind == FrameKind::Reset && len != 0 {
            return Err(TransportError::MalformedFrame {
                message: format!("reset frame on stream {stream} carries {len} bytes"),
            });
        }
        if kind == FrameKind::Mapped {
            return Ok(Some(Self::mapped(stream, len)));
        }

        let mut payload = vec![0_u8; len];
        reader.read_exact(&mut payload).map_err(|source| {
            if source.kind() == io::ErrorKind::UnexpectedEof {
                TransportError::MalformedFrame {
                    message: format!("stream {stream} payload truncated"),
                }
            } else {
                TransportError::io("reading frame payload", source)
            }
        })?;
        Ok(Some(Self {
            stream,
            kind,
            payload,
            mapped: 0,
        }))
    }
}

fn read_header<R: Read>(reader: &mut R) -> Result<Option<[u8; HEADER_LEN]>, TransportError> {
    let mut header = [0_u8; HEADER_LEN];
    let mut filled = 0;
    while let Some(rest) = header.get_mut(filled..)
        && !rest.is_empty()
    {
        match reader.read(rest) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(TransportError::MalformedFrame {
                    message: format!("header truncated after {filled} bytes"),
                });
            }
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => return Err(TransportError::io("reading frame header", source)),
        }
    }
    Ok(Some(header))
}
