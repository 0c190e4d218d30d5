//! Newline-delimited framing that survives bad lines
//!
//! [`LinesCodec`] reports an overlong or non-UTF-8 line as a decoder error,
//! and `FramedRead` ends the stream after any decoder error. [`LineFrames`]
//! turns those two cases into [`Frame::Rejected`] items so one bad line costs
//! only that line.

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// One decoded line, or the reason it was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete UTF-8 line without its terminator
    Line(String),
    /// The line was skipped; the stream continues after it
    Rejected(LineRejection),
}

/// Why a line was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRejection {
    /// Longer than the configured maximum
    TooLong,
    /// Not valid UTF-8
    InvalidUtf8,
}

impl std::fmt::Display for LineRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLong => f.write_str("line exceeds the maximum length"),
            Self::InvalidUtf8 => f.write_str("line is not valid UTF-8"),
        }
    }
}

/// Line codec for JSON-per-line channels
#[derive(Debug, Clone)]
pub struct LineFrames {
    inner: LinesCodec,
}

impl LineFrames {
    /// Reject lines longer than `max_length` bytes
    #[must_use]
    pub fn new(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn recover(result: Result<Option<String>, LinesCodecError>) -> io::Result<Option<Frame>> {
        match result {
            Ok(line) => Ok(line.map(Frame::Line)),
            // The inner codec discards up to the next newline on its own.
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Ok(Some(Frame::Rejected(LineRejection::TooLong)))
            }
            // The offending line was already consumed from the buffer.
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Frame::Rejected(LineRejection::InvalidUtf8)))
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for LineFrames {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        Self::recover(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        Self::recover(self.inner.decode_eof(buf))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineFrames {
    type Error = io::Error;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> io::Result<()> {
        self.inner.encode(line, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            other => io::Error::other(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;

    async fn frames(input: &[u8], max_length: usize) -> Vec<Frame> {
        FramedRead::new(input, LineFrames::new(max_length))
            .map(|frame| frame.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn bad_lines_are_rejected_and_reading_continues() {
        let input = b"first\n\xff\xfe garbage\n0123456789abcdefghij\nlast\n";

        let frames = frames(input, 16).await;

        assert_eq!(
            frames,
            vec![
                Frame::Line("first".into()),
                Frame::Rejected(LineRejection::InvalidUtf8),
                Frame::Rejected(LineRejection::TooLong),
                Frame::Line("last".into()),
            ]
        );
    }

    #[tokio::test]
    async fn unterminated_tail_is_still_a_line() {
        assert_eq!(
            frames(b"a\nb", 8).await,
            vec![Frame::Line("a".into()), Frame::Line("b".into())]
        );
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = LineFrames::new(16);
        let mut buf = BytesMut::new();
        codec.encode("{}", &mut buf).unwrap();
        assert_eq!(&buf[..], b"{}\n");
    }
}
