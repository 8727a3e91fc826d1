//! Length-prefixed binary framing.
//!
//! Every frame is a little-endian `i32` length followed by a body of exactly
//! that many bytes:
//!
//! ```text
//! frame    := len:i32 body[len]
//! body     := kind:u8 flags:u8 token:u64 rest
//! request  := name:str16 cancel_count:u32 cancel_token:u64* payload
//! response := payload | code:u16 message:str32   (failed flag set)
//! payload  := type_id:str16 body_len:u32 body[body_len]
//! ```
//!
//! A bad length or an undecodable body is a protocol fault: the frame is
//! lost but the stream stays usable. Any I/O failure is a transport fault.

use crate::config::FrameConfig;
use crate::error::{FaultCode, RpcError};
use crate::message::{Direction, Frame, Outcome, Payload, Request, Response};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

const FLAG_REVERSE: u8 = 0b01;
const FLAG_FAILED: u8 = 0b10;
const KNOWN_FLAGS: u8 = FLAG_REVERSE | FLAG_FAILED;

/// Failure while reading or writing one frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame was malformed and has been discarded.
    #[error("Protocol fault: {0}")]
    Protocol(String),

    /// The underlying stream failed or reached end of file.
    #[error("Transport fault: {0}")]
    Transport(#[from] std::io::Error),
}

impl FrameError {
    pub fn is_transport(&self) -> bool {
        matches!(self, FrameError::Transport(_))
    }
}

impl From<FrameError> for RpcError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Protocol(message) => RpcError::Protocol(message),
            FrameError::Transport(e) => e.into(),
        }
    }
}

/// Encode a frame body without its length prefix.
pub fn encode_body(frame: &Frame) -> Result<BytesMut, FrameError> {
    let mut buf = BytesMut::with_capacity(FrameConfig::ENVELOPE_SIZE + 64);
    match frame {
        Frame::Request(request) => {
            buf.put_u8(KIND_REQUEST);
            buf.put_u8(direction_flag(request.direction));
            buf.put_u64_le(request.token);
            put_str16(&mut buf, &request.function_name, "function name")?;
            buf.put_u32_le(checked_u32(request.cancel_tokens.len(), "cancel token list")?);
            for token in &request.cancel_tokens {
                buf.put_u64_le(*token);
            }
            put_payload(&mut buf, &request.payload)?;
        }
        Frame::Response(response) => {
            buf.put_u8(KIND_RESPONSE);
            match &response.outcome {
                Outcome::Success(payload) => {
                    buf.put_u8(direction_flag(response.direction));
                    buf.put_u64_le(response.token);
                    put_payload(&mut buf, payload)?;
                }
                Outcome::Failure { code, message } => {
                    buf.put_u8(direction_flag(response.direction) | FLAG_FAILED);
                    buf.put_u64_le(response.token);
                    buf.put_u16_le(code.as_u16());
                    buf.put_u32_le(checked_u32(message.len(), "fault message")?);
                    buf.put_slice(message.as_bytes());
                }
            }
        }
    }

    check_size(buf.len())?;
    Ok(buf)
}

/// Check that a request can be encoded, without encoding it.
pub fn check_request(request: &Request) -> Result<(), FrameError> {
    let name = str16_len(&request.function_name, "function name")?;
    checked_u32(request.cancel_tokens.len(), "cancel token list")?;
    let size = FrameConfig::ENVELOPE_SIZE
        .saturating_add(name)
        .saturating_add(4)
        .saturating_add(request.cancel_tokens.len().saturating_mul(8))
        .saturating_add(payload_len(&request.payload)?);
    check_size(size)
}

/// Check that a response can be encoded, without encoding it.
pub fn check_response(response: &Response) -> Result<(), FrameError> {
    let rest = match &response.outcome {
        Outcome::Success(payload) => payload_len(payload)?,
        Outcome::Failure { message, .. } => {
            checked_u32(message.len(), "fault message")?;
            (2 + 4usize).saturating_add(message.len())
        }
    };
    check_size(FrameConfig::ENVELOPE_SIZE.saturating_add(rest))
}

fn check_size(size: usize) -> Result<(), FrameError> {
    if size > FrameConfig::MAX_FRAME_SIZE {
        return Err(FrameError::Protocol(format!(
            "Frame size {} exceeds maximum {}",
            size,
            FrameConfig::MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

fn str16_len(value: &str, what: &str) -> Result<usize, FrameError> {
    u16::try_from(value.len())
        .map(|len| 2 + len as usize)
        .map_err(|_| FrameError::Protocol(format!("{} too long: {}", what, value.len())))
}

fn payload_len(payload: &Payload) -> Result<usize, FrameError> {
    let type_id = str16_len(&payload.type_id, "payload type id")?;
    checked_u32(payload.body.len(), "payload body")?;
    Ok(type_id.saturating_add(4).saturating_add(payload.body.len()))
}

/// Encode a frame including its length prefix.
pub fn encode_frame(frame: &Frame) -> crate::error::Result<Bytes> {
    let body = encode_body(frame)?;
    let mut buf = BytesMut::with_capacity(FrameConfig::HEADER_SIZE + body.len());
    // encode_body caps the length well below i32::MAX
    buf.put_i32_le(body.len() as i32);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// Decode a frame body (without its length prefix).
pub fn decode_body(mut body: Bytes) -> Result<Frame, FrameError> {
    ensure(&body, FrameConfig::ENVELOPE_SIZE, "envelope")?;
    let kind = body.get_u8();
    let flags = body.get_u8();
    let token = body.get_u64_le();

    if flags & !KNOWN_FLAGS != 0 {
        return Err(FrameError::Protocol(format!("Unknown flag bits {:#04x}", flags)));
    }
    let direction = Direction::from_reverse(flags & FLAG_REVERSE != 0);

    let frame = match kind {
        KIND_REQUEST => {
            if flags & FLAG_FAILED != 0 {
                return Err(FrameError::Protocol(
                    "Failed flag set on a request".to_string(),
                ));
            }
            let function_name = get_str16(&mut body, "function name")?;
            ensure(&body, 4, "cancel count")?;
            let count = body.get_u32_le() as usize;
            // Bound the count by what is actually left before allocating
            ensure(&body, count.saturating_mul(8), "cancel tokens")?;
            let cancel_tokens = (0..count).map(|_| body.get_u64_le()).collect();
            let payload = get_payload(&mut body)?;
            Frame::Request(Request {
                function_name,
                payload,
                token,
                cancel_tokens,
                direction,
            })
        }
        KIND_RESPONSE if flags & FLAG_FAILED != 0 => {
            ensure(&body, 2, "fault code")?;
            let code = FaultCode::from_u16(body.get_u16_le());
            ensure(&body, 4, "fault message length")?;
            let len = body.get_u32_le() as usize;
            let message = get_str(&mut body, len, "fault message")?;
            Frame::Response(Response::failure(token, direction, code, message))
        }
        KIND_RESPONSE => {
            let payload = get_payload(&mut body)?;
            Frame::Response(Response::success(token, direction, payload))
        }
        other => {
            return Err(FrameError::Protocol(format!("Unknown frame kind {}", other)));
        }
    };

    if body.has_remaining() {
        return Err(FrameError::Protocol(format!(
            "{} trailing bytes after frame body",
            body.remaining()
        )));
    }
    Ok(frame)
}

/// Read one frame from an async reader.
///
/// Partial reads are looped over until the whole frame has arrived. Clean
/// end of file surfaces as a transport fault of kind `UnexpectedEof`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    read_frame_limited(reader, FrameConfig::MAX_FRAME_SIZE).await
}

/// Read one frame, rejecting bodies larger than `max_size`.
///
/// An oversized body is read and thrown away so the next header lines up.
pub async fn read_frame_limited<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Frame, FrameError> {
    let mut len_buf = [0u8; FrameConfig::HEADER_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = i32::from_le_bytes(len_buf);

    if len < 0 {
        return Err(FrameError::Protocol(format!("Negative frame length {}", len)));
    }
    let len = len as usize;

    if len > max_size {
        let drained =
            tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink()).await?;
        if drained < len as u64 {
            return Err(FrameError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside an oversized frame",
            )));
        }
        return Err(FrameError::Protocol(format!(
            "Frame size {} exceeds maximum {}",
            len, max_size
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_body(Bytes::from(body))
}

/// Write one frame to an async writer and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let body = encode_body(frame)?;
    writer.write_all(&(body.len() as i32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn direction_flag(direction: Direction) -> u8 {
    if direction.is_reverse() {
        FLAG_REVERSE
    } else {
        0
    }
}

fn checked_u32(len: usize, what: &str) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::Protocol(format!("{} too long: {}", what, len)))
}

fn put_str16(buf: &mut BytesMut, value: &str, what: &str) -> Result<(), FrameError> {
    str16_len(value, what)?;
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_payload(buf: &mut BytesMut, payload: &Payload) -> Result<(), FrameError> {
    put_str16(buf, &payload.type_id, "payload type id")?;
    buf.put_u32_le(checked_u32(payload.body.len(), "payload body")?);
    buf.put_slice(&payload.body);
    Ok(())
}

fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<(), FrameError> {
    if buf.remaining() < needed {
        return Err(FrameError::Protocol(format!(
            "Truncated {}: need {} bytes, have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_str(buf: &mut Bytes, len: usize, what: &str) -> Result<String, FrameError> {
    ensure(buf, len, what)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| FrameError::Protocol(format!("Invalid UTF-8 in {}: {}", what, e)))
}

fn get_str16(buf: &mut Bytes, what: &str) -> Result<String, FrameError> {
    ensure(buf, 2, what)?;
    let len = buf.get_u16_le() as usize;
    get_str(buf, len, what)
}

fn get_payload(buf: &mut Bytes) -> Result<Payload, FrameError> {
    let type_id = get_str16(buf, "payload type id")?;
    ensure(buf, 4, "payload length")?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len, "payload body")?;
    let body = buf.split_to(len);
    Ok(Payload { type_id, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Frame {
        Frame::Request(Request {
            function_name: "Sqrt".to_string(),
            payload: Payload::new("test.Value", b"{\"value\":4.0}".to_vec()),
            token: 42,
            cancel_tokens: vec![7, 9],
            direction: Direction::Reverse,
        })
    }

    fn raw_frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as i32).to_le_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_request_layout() {
        let bytes = encode_frame(&sample_request()).unwrap();
        let len = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        assert_eq!(bytes[4], KIND_REQUEST);
        assert_eq!(bytes[5], FLAG_REVERSE);
        assert_eq!(u64::from_le_bytes(bytes[6..14].try_into().unwrap()), 42);
        assert_eq!(u16::from_le_bytes([bytes[14], bytes[15]]), 4);
        assert_eq!(&bytes[16..20], b"Sqrt");
    }

    #[tokio::test]
    async fn test_request_survives_the_wire() {
        let frame = sample_request();
        let bytes = encode_frame(&frame).unwrap();
        let mut reader: &[u8] = &bytes;
        assert_eq!(read_frame(&mut reader).await.unwrap(), frame);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_failed_response_survives_the_wire() {
        let frame = Frame::Response(Response::failure(
            u64::MAX,
            Direction::Forward,
            FaultCode::UnknownFunction,
            "Unknown function: Nope",
        ));
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes[5], FLAG_FAILED);

        let mut reader: &[u8] = &bytes;
        assert_eq!(read_frame(&mut reader).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_partial_reads_are_reassembled() {
        let frame = sample_request();
        let bytes = encode_frame(&frame).unwrap();
        let (mut client, mut server) = tokio::io::duplex(3);

        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(5) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        assert_eq!(read_frame(&mut server).await.unwrap(), frame);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_length_is_protocol_fault_and_stream_continues() {
        let mut stream = (-5i32).to_le_bytes().to_vec();
        stream.extend_from_slice(&encode_frame(&sample_request()).unwrap());
        let mut reader: &[u8] = &stream;

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::Protocol(_))
        ));
        assert_eq!(read_frame(&mut reader).await.unwrap(), sample_request());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_drained() {
        let mut stream = raw_frame(&[0xAB; 64]);
        stream.extend_from_slice(&encode_frame(&sample_request()).unwrap());
        let mut reader: &[u8] = &stream;

        let err = read_frame_limited(&mut reader, 32).await.unwrap_err();
        assert!(matches!(err, FrameError::Protocol(_)));
        assert_eq!(
            read_frame_limited(&mut reader, 1024).await.unwrap(),
            sample_request()
        );
    }

    #[tokio::test]
    async fn test_clean_eof_is_transport_fault() {
        let mut reader: &[u8] = &[];
        match read_frame(&mut reader).await {
            Err(FrameError::Transport(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("Expected transport fault, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_body_is_transport_fault() {
        let mut stream = 100i32.to_le_bytes().to_vec();
        stream.extend_from_slice(&[0u8; 10]);
        let mut reader: &[u8] = &stream;
        assert!(read_frame(&mut reader).await.unwrap_err().is_transport());
    }

    #[test]
    fn test_undecodable_bodies() {
        // unknown kind
        let mut body = vec![7u8, 0];
        body.extend_from_slice(&1u64.to_le_bytes());
        assert!(matches!(
            decode_body(Bytes::from(body)),
            Err(FrameError::Protocol(_))
        ));

        // unknown flag bits
        let mut body = vec![KIND_RESPONSE, 0b100];
        body.extend_from_slice(&1u64.to_le_bytes());
        assert!(matches!(
            decode_body(Bytes::from(body)),
            Err(FrameError::Protocol(_))
        ));

        // trailing bytes
        let mut body = encode_body(&sample_request()).unwrap().to_vec();
        body.push(0);
        assert!(matches!(
            decode_body(Bytes::from(body)),
            Err(FrameError::Protocol(_))
        ));

        // invalid UTF-8 in the function name
        let mut body = vec![KIND_REQUEST, 0];
        body.extend_from_slice(&1u64.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(&[0xFF, 0xFE]);
        assert!(matches!(
            decode_body(Bytes::from(body)),
            Err(FrameError::Protocol(_))
        ));
    }

    #[test]
    fn test_huge_cancel_count_is_rejected_without_allocating() {
        let mut body = vec![KIND_REQUEST, 0];
        body.extend_from_slice(&1u64.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_body(Bytes::from(body)),
            Err(FrameError::Protocol(_))
        ));
    }

    #[test]
    fn test_overlong_function_name_cannot_be_encoded() {
        let frame = Frame::Request(Request::call(
            1,
            "x".repeat(u16::MAX as usize + 1),
            Payload::empty(),
            Direction::Forward,
        ));
        assert!(matches!(encode_frame(&frame), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_checks_agree_with_encoder() {
        let request = Request::call(1, "Echo", Payload::empty(), Direction::Forward);
        assert!(check_request(&request).is_ok());
        assert_eq!(
            encode_body(&Frame::Request(request.clone())).unwrap().len(),
            FrameConfig::ENVELOPE_SIZE + 2 + 4 + 4 + 2 + 4
        );

        let long_type = Payload::new("t".repeat(70_000), b"{}".to_vec());
        let request = Request::call(1, "Echo", long_type.clone(), Direction::Forward);
        assert!(check_request(&request).is_err());
        assert!(encode_body(&Frame::Request(request)).is_err());

        let response = Response::success(1, Direction::Forward, long_type);
        assert!(check_response(&response).is_err());
        assert!(encode_body(&Frame::Response(response)).is_err());

        let huge = Payload::new("t", vec![0u8; FrameConfig::MAX_FRAME_SIZE]);
        let response = Response::success(1, Direction::Forward, huge);
        assert!(matches!(check_response(&response), Err(FrameError::Protocol(_))));

        let failure = Response::failure(1, Direction::Forward, FaultCode::Codec, "bad");
        assert!(check_response(&failure).is_ok());
    }
}
