//! Framing layer of the Z-Wave Serial API.
//!
//! A data frame on the wire is:
//!
//! ```text
//! +0  SOF (0x01)
//! +1  length     (counts everything after itself, checksum included)
//! +2  type       (REQUEST 0x00 / RESPONSE 0x01)
//! +3  function id
//! +4  payload    (variable)
//! +n  checksum   (0xFF XOR length XOR type XOR function XOR payload bytes)
//! ```
//!
//! ACK, NAK and CAN are single-byte control tokens outside any frame.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::core::constants::{
    ACK, CAN, FRAME_BODY_TIMEOUT, LENGTH_BYTE_TIMEOUT, NAK, SOF,
};
use crate::core::error::FrameError;

/// Smallest legal length byte: type + function id + checksum.
const MIN_FRAME_LENGTH: u8 = 3;

/// Compute the frame checksum over the length byte and everything after it
/// up to, but excluding, the checksum byte itself.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0xff, |chk, b| chk ^ b)
}

/// Encode a frame around the given type, function id and payload.
pub fn encode(msg_type: u8, function_id: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 3) as u8;
    let mut buf = Vec::with_capacity(payload.len() + 5);
    buf.push(SOF);
    buf.push(length);
    buf.push(msg_type);
    buf.push(function_id);
    buf.extend_from_slice(payload);
    let chk = checksum(&buf[1..]);
    buf.push(chk);
    buf
}

/// First byte of an incoming exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// A data frame follows.
    Sof,
    /// The controller acknowledged our frame.
    Ack,
    /// The controller rejected our frame.
    Nak,
    /// The controller cancelled our frame.
    Can,
    /// A byte outside any frame; the stream has lost sync.
    OutOfFrame(u8),
}

impl Token {
    fn from_byte(byte: u8) -> Self {
        match byte {
            SOF => Token::Sof,
            ACK => Token::Ack,
            NAK => Token::Nak,
            CAN => Token::Can,
            other => Token::OutOfFrame(other),
        }
    }
}

/// Incremental frame reader over a byte transport.
///
/// [`next_token`](FrameReader::next_token) reads exactly one byte and is
/// safe to race against other events in a `select!`; once a SOF has been
/// seen, [`read_frame`](FrameReader::read_frame) must be driven to
/// completion so a partial frame is never abandoned mid-stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    port: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a byte transport.
    pub fn new(port: R) -> Self {
        Self { port }
    }

    /// Read the next control token or start-of-frame marker.
    pub async fn next_token(&mut self) -> io::Result<Token> {
        let byte = self.port.read_u8().await?;
        Ok(Token::from_byte(byte))
    }

    /// Read the rest of a frame after its SOF byte.
    ///
    /// On success the returned buffer holds `<type> <function id> <payload…>`
    /// with the verified checksum stripped. The length byte gets 100 ms to
    /// arrive and the body 500 ms; on either deadline the read is abandoned
    /// and the caller should resynchronise on the next token.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        let length = timeout(LENGTH_BYTE_TIMEOUT, self.port.read_u8())
            .await
            .map_err(|_| FrameError::LengthTimeout)??;

        if length < MIN_FRAME_LENGTH {
            return Err(FrameError::InvalidLength(length));
        }

        let mut body = vec![0u8; length as usize];
        timeout(FRAME_BODY_TIMEOUT, self.port.read_exact(&mut body))
            .await
            .map_err(|_| FrameError::BodyTimeout {
                expected: length as usize,
            })??;

        let received = body[length as usize - 1];
        let mut computed = 0xff ^ length;
        for b in &body[..length as usize - 1] {
            computed ^= b;
        }

        if computed != received {
            return Err(FrameError::ChecksumMismatch { computed, received });
        }

        body.truncate(length as usize - 1);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{FUNC_ID_ZW_GET_VERSION, REQUEST, RESPONSE};

    #[test]
    fn test_checksum_known_frame() {
        // GET_VERSION request: 01 03 00 15 e9
        let frame = encode(REQUEST, FUNC_ID_ZW_GET_VERSION, &[]);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x15, 0xe9]);
    }

    #[test]
    fn test_encode_with_payload() {
        let frame = encode(RESPONSE, 0x20, &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(frame[0], SOF);
        assert_eq!(frame[1] as usize, frame.len() - 2);
        assert_eq!(frame[2], RESPONSE);
        assert_eq!(frame[3], 0x20);
        assert_eq!(&frame[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(*frame.last().unwrap(), checksum(&frame[1..frame.len() - 1]));
    }

    #[test]
    fn test_token_classification() {
        assert_eq!(Token::from_byte(SOF), Token::Sof);
        assert_eq!(Token::from_byte(ACK), Token::Ack);
        assert_eq!(Token::from_byte(NAK), Token::Nak);
        assert_eq!(Token::from_byte(CAN), Token::Can);
        assert_eq!(Token::from_byte(0x42), Token::OutOfFrame(0x42));
    }

    #[tokio::test]
    async fn test_read_frame_roundtrip() {
        let frame = encode(REQUEST, 0x13, &[0x07, 0x02, 0x25, 0x01]);
        let mut reader = FrameReader::new(&frame[..]);

        assert_eq!(reader.next_token().await.unwrap(), Token::Sof);
        let body = reader.read_frame().await.unwrap();
        assert_eq!(body, vec![0x00, 0x13, 0x07, 0x02, 0x25, 0x01]);
    }

    #[tokio::test]
    async fn test_read_frame_bad_checksum() {
        let mut frame = encode(REQUEST, 0x13, &[0x07]);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let mut reader = FrameReader::new(&frame[..]);
        assert_eq!(reader.next_token().await.unwrap(), Token::Sof);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_short_length() {
        // SOF followed by a length byte that cannot hold type + func + chk.
        let bytes = [SOF, 0x02, 0x00, 0x15];
        let mut reader = FrameReader::new(&bytes[..]);
        assert_eq!(reader.next_token().await.unwrap(), Token::Sof);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength(0x02)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_frame_length_timeout() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(client);

        use tokio::io::AsyncWriteExt;
        server.write_all(&[SOF]).await.unwrap();

        assert_eq!(reader.next_token().await.unwrap(), Token::Sof);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::LengthTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_frame_body_timeout() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(client);

        use tokio::io::AsyncWriteExt;
        // Promise five bytes, deliver two.
        server.write_all(&[SOF, 0x05, 0x00, 0x13]).await.unwrap();

        assert_eq!(reader.next_token().await.unwrap(), Token::Sof);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::BodyTimeout { expected: 5 }));
    }
}
