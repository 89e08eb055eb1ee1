/// IRC line codec — frames a TCP byte stream into IRC messages.
///
/// Splits on `\n`, tolerating both `\r\n` (per RFC 2812) and bare `\n`
/// terminators from sloppy clients, parses each line into a [`Message`],
/// and serializes outgoing messages with `\r\n` termination. Blank lines
/// between terminators are skipped.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError};

/// Maximum line length (including the terminator).
/// RFC 2812 says 512 bytes. IRCv3 `message-tags` can push this to 8191.
const MAX_LINE_LENGTH: usize = 8191;

/// Codec error: either a protocol parse failure or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames IRC messages on line boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let lf_pos = src.iter().position(|b| *b == b'\n');

            match lf_pos {
                Some(pos) => {
                    // Extract the line, advance past the `\n`, trim a `\r`.
                    let line_bytes = src.split_to(pos);
                    src.advance(1);
                    let line_bytes = match line_bytes.last() {
                        Some(b'\r') => &line_bytes[..line_bytes.len() - 1],
                        _ => &line_bytes[..],
                    };

                    if line_bytes.is_empty() {
                        continue;
                    }

                    let line = std::str::from_utf8(line_bytes)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

                    return Ok(Some(Message::parse(line)?));
                }
                None => {
                    // No complete line yet. A buffer past the cap with no
                    // terminator is a framing violation — close the connection
                    // rather than let a client grow the buffer unbounded.
                    if src.len() > MAX_LINE_LENGTH {
                        return Err(CodecError::LineTooLong);
                    }
                    return Ok(None);
                }
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
