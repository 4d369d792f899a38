use bytes::{BufMut, Bytes, BytesMut};

use crate::utils::RingBuffer;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Rule used to cut one message out of a connection's inbound bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// A frame ends at `\n`; the delimiter and a trailing `\r` are dropped.
    Delimited { max_frame_size: usize },
    /// A big-endian unsigned prefix of `width` bytes holds the body length.
    LengthPrefixed { width: u8, max_frame_size: usize },
}

impl Framing {
    /// `width == 0` selects newline framing. `max_frame_size == 0` is unlimited.
    pub fn new(width: u8, max_frame_size: usize) -> Self {
        match width {
            0 => Framing::Delimited { max_frame_size },
            width => Framing::LengthPrefixed {
                width,
                max_frame_size,
            },
        }
    }

    fn max_frame_size(&self) -> usize {
        match *self {
            Framing::Delimited { max_frame_size } => max_frame_size,
            Framing::LengthPrefixed { max_frame_size, .. } => max_frame_size,
        }
    }

    fn check_size(&self, len: usize) -> AppResult<()> {
        let max = self.max_frame_size();
        if max > 0 && len > max {
            return Err(AppError::FrameTooLarge(len));
        }
        Ok(())
    }

    /// Checks whether a whole frame is buffered.
    ///
    /// Returns `(header_len, body_len, trailer_len)`; the frame occupies
    /// `header_len + body_len + trailer_len` bytes at the front of the buffer.
    pub fn check(&self, buffer: &RingBuffer) -> AppResult<(usize, usize, usize)> {
        match *self {
            Framing::Delimited { .. } => {
                let (head, tail) = buffer.peek(0);
                let pos = head
                    .iter()
                    .position(|b| *b == b'\n')
                    .or_else(|| {
                        tail.iter()
                            .position(|b| *b == b'\n')
                            .map(|p| head.len() + p)
                    });
                let Some(pos) = pos else {
                    self.check_size(buffer.buffered())?;
                    return Err(Incomplete);
                };
                self.check_size(pos)?;

                let carriage_return = pos > 0 && {
                    let (h, t) = buffer.peek(pos);
                    t.last().or(h.last()) == Some(&b'\r')
                };
                if carriage_return {
                    Ok((0, pos - 1, 2))
                } else {
                    Ok((0, pos, 1))
                }
            }
            Framing::LengthPrefixed { width, .. } => {
                let width = width as usize;
                if buffer.buffered() < width {
                    return Err(Incomplete);
                }
                let (head, tail) = buffer.peek(width);
                let body_len = head
                    .iter()
                    .chain(tail.iter())
                    .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
                let body_len = usize::try_from(body_len)
                    .map_err(|_| AppError::FrameTooLarge(usize::MAX))?;
                self.check_size(body_len)?;

                match width.checked_add(body_len) {
                    Some(total) if buffer.buffered() >= total => Ok((width, body_len, 0)),
                    _ => Err(Incomplete),
                }
            }
        }
    }

    /// Takes the next complete frame body off the buffer, if there is one.
    pub fn parse(&self, buffer: &mut RingBuffer) -> AppResult<Option<Bytes>> {
        match self.check(buffer) {
            Ok((header_len, body_len, trailer_len)) => {
                buffer.discard(header_len);
                let mut body = BytesMut::zeroed(body_len);
                buffer.read(&mut body);
                buffer.discard(trailer_len);
                Ok(Some(body.freeze()))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Takes what is left once the peer stopped sending.
    ///
    /// An unterminated last line is still a frame; a trailing `\r` is
    /// dropped as for any line. A partial length-prefixed frame can never
    /// complete and is discarded.
    pub fn parse_at_eof(&self, buffer: &mut RingBuffer) -> AppResult<Option<Bytes>> {
        let remaining = buffer.buffered();
        if remaining == 0 {
            return Ok(None);
        }
        match *self {
            Framing::Delimited { .. } => {
                self.check_size(remaining)?;
                let mut body = BytesMut::zeroed(remaining);
                buffer.read(&mut body);
                if body.last() == Some(&b'\r') {
                    body.truncate(remaining - 1);
                }
                Ok(Some(body.freeze()))
            }
            Framing::LengthPrefixed { .. } => {
                buffer.discard(remaining);
                Ok(None)
            }
        }
    }

    /// Wraps `body` so a peer using the same framing reads it back as one
    /// frame.
    pub fn encode(&self, body: &[u8]) -> AppResult<Bytes> {
        self.check_size(body.len())?;
        match *self {
            Framing::Delimited { .. } => {
                let mut frame = BytesMut::with_capacity(body.len() + 1);
                frame.put_slice(body);
                frame.put_u8(b'\n');
                Ok(frame.freeze())
            }
            Framing::LengthPrefixed { width, .. } => {
                let width = width as usize;
                let len = body.len() as u64;
                if width < 8 && len >> (width * 8) != 0 {
                    return Err(AppError::FrameTooLarge(body.len()));
                }
                let mut frame = BytesMut::with_capacity(width + body.len());
                frame.put_slice(&len.to_be_bytes()[8 - width..]);
                frame.put_slice(body);
                Ok(frame.freeze())
            }
        }
    }
}
