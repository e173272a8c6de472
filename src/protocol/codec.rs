use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::core::{Error, DEFAULT_MAX_FRAME_LENGTH};
use super::command::Command;
use super::FRAME_DELIMITER;

/// Splits the gateway byte stream into blank-line terminated messages
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Offset already searched for a delimiter
    next_index: usize,
    /// Largest message accepted without a delimiter
    max_length: usize,
}

impl FrameCodec {
    /// Creates a new frame codec
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Creates a frame codec with a custom size limit
    pub fn with_max_length(max_length: usize) -> Self {
        FrameCodec {
            next_index: 0,
            max_length,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(FRAME_DELIMITER.len())
        .position(|window| window == FRAME_DELIMITER)
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Back up so a delimiter split across two reads is still found
        let start = self
            .next_index
            .saturating_sub(FRAME_DELIMITER.len() - 1)
            .min(src.len());

        match find_delimiter(&src[start..]) {
            Some(offset) => {
                let end = start + offset + FRAME_DELIMITER.len();
                self.next_index = 0;
                Ok(Some(src.split_to(end).freeze()))
            }
            None => {
                if src.len() > self.max_length {
                    return Err(Error::protocol(format!(
                        "{} bytes received without a message delimiter (limit {})",
                        src.len(),
                        self.max_length
                    )));
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if !buf.is_empty() {
            debug!(bytes = buf.len(), "Discarding partial message at end of stream");
            buf.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len());
        dst.put_slice(wire.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_single_message() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"Response: Success\r\nMessage: ok\r\n\r\n"[..]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"Response: Success\r\nMessage: ok\r\n\r\n");
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_remainder_stays_buffered() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"Event: A\r\n\r\nEvent: B\r\nID:"[..]);

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&buf[..], b"Event: B\r\nID:");
    }

    #[test]
    fn test_every_split_point_yields_identical_messages() {
        let stream: &[u8] = b"Response: Success\r\n\r\nEvent: ReceivedSMS\r\nID: 1\r\n\r\nResponse: Follows\r\n--END COMMAND--\r\n\r\n";
        let expected = vec![
            &b"Response: Success\r\n\r\n"[..],
            &b"Event: ReceivedSMS\r\nID: 1\r\n\r\n"[..],
            &b"Response: Follows\r\n--END COMMAND--\r\n\r\n"[..],
        ];

        for first in 0..stream.len() {
            for second in first..stream.len() {
                let mut codec = FrameCodec::new();
                let mut buf = BytesMut::new();
                let mut frames = Vec::new();
                for chunk in [&stream[..first], &stream[first..second], &stream[second..]] {
                    buf.extend_from_slice(chunk);
                    frames.extend(decode_all(&mut codec, &mut buf));
                }
                let frames: Vec<&[u8]> = frames.iter().map(|f| &f[..]).collect();
                assert_eq!(frames, expected, "split at {} and {}", first, second);
                assert!(buf.is_empty());
            }
        }
    }

    #[test]
    fn test_byte_by_byte_delimiter() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in b"Action: Ping\r\n\r\n" {
            buf.put_u8(*byte);
            frames.extend(decode_all(&mut codec, &mut buf));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"Action: Ping\r\n\r\n");
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut codec = FrameCodec::with_max_length(16);
        let mut buf = BytesMut::from(&b"GSM span 2: Power on, Provisioned"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_partial_message_discarded_at_eof() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"Event: A\r\n\r\nEvent: trunc"[..]);

        assert!(codec.decode_eof(&mut buf).unwrap().is_some());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_command() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Command::Ping, &mut buf).unwrap();
        assert_eq!(&buf[..], b"Action: Ping\r\n\r\n");
    }
}
