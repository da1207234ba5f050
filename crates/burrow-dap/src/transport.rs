//! Content-Length framed transport for DAP messages.
//!
//! Each frame is a block of `Name: Value` header lines terminated by a bare
//! `\r\n`, followed by exactly `Content-Length` bytes of UTF-8 JSON. There
//! is no separator after the body; the next frame's headers begin
//! immediately.

use std::collections::HashMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DapError;
use crate::protocol::Message;

/// Encode a message into a framed byte buffer.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, DapError> {
    let body = serde_json::to_vec(message).map_err(|e| DapError::InvalidMessage(e.to_string()))?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut buf = Vec::with_capacity(header.len() + body.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Serialize a message and write the full frame to `writer`.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), DapError>
where
    W: AsyncWrite + Unpin,
{
    let framed = encode_message(message)?;
    writer
        .write_all(&framed)
        .await
        .map_err(|e| DapError::Transport(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| DapError::Transport(format!("flush failed: {e}")))?;
    Ok(())
}

/// Read one header block from `reader`.
///
/// Returns the parsed headers, or `None` if the stream ended cleanly before
/// any header byte (the normal end-of-connection case). Headers other than
/// `Content-Length` are tolerated and returned alongside it. EOF in the
/// middle of a header block is a framing error.
pub async fn read_headers<R>(reader: &mut R) -> Result<Option<HashMap<String, String>>, DapError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| DapError::Transport(format!("header read failed: {e}")))?;
        if n == 0 {
            if headers.is_empty() {
                return Ok(None);
            }
            return Err(DapError::Transport(
                "stream ended inside a header block".into(),
            ));
        }
        if line == "\r\n" {
            return Ok(Some(headers));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| DapError::Transport(format!("malformed header line: {line:?}")))?;
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }
}

/// Read one complete message from `reader`.
///
/// Returns `None` on clean EOF at a frame boundary. Truncated frames,
/// missing or unparseable `Content-Length`, and bodies that are not valid
/// JSON messages are all errors; the caller treats any of them as fatal to
/// the connection.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, DapError>
where
    R: AsyncBufRead + Unpin,
{
    let headers = match read_headers(reader).await? {
        Some(headers) => headers,
        None => return Ok(None),
    };

    let length: usize = headers
        .get("Content-Length")
        .ok_or_else(|| DapError::Transport("missing Content-Length header".into()))?
        .parse()
        .map_err(|e| DapError::Transport(format!("invalid Content-Length value: {e}")))?;

    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| DapError::Transport(format!("stream ended mid-body: {e}")))?;

    let message =
        serde_json::from_slice(&body).map_err(|e| DapError::InvalidMessage(e.to_string()))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Event, Request, Response};

    fn request(seq: i64, command: &str) -> Message {
        Message::Request(Request {
            seq,
            command: command.into(),
            arguments: Some(serde_json::json!({"hello": "world"})),
        })
    }

    #[test]
    fn transport_encode_has_header_and_exact_length() {
        let framed = encode_message(&request(1, "initialize")).unwrap();
        let text = String::from_utf8(framed).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        let declared: usize = header.strip_prefix("Content-Length: ").unwrap().parse().unwrap();
        assert_eq!(declared, body.len());
    }

    #[tokio::test]
    async fn transport_round_trip_request() {
        let msg = request(1, "initialize");
        let framed = encode_message(&msg).unwrap();
        let decoded = read_message(&mut &framed[..]).await.unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn transport_round_trip_response() {
        let msg = Message::Response(Response {
            seq: 2,
            request_seq: 1,
            success: true,
            command: "initialize".into(),
            message: None,
            body: Some(serde_json::json!({"supportsConfigurationDoneRequest": true})),
            extra: serde_json::Map::new(),
        });
        let framed = encode_message(&msg).unwrap();
        let decoded = read_message(&mut &framed[..]).await.unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn transport_round_trip_event() {
        let msg = Message::Event(Event {
            seq: 3,
            event: "stopped".into(),
            body: Some(serde_json::json!({"reason": "breakpoint", "threadId": 1})),
        });
        let framed = encode_message(&msg).unwrap();
        let decoded = read_message(&mut &framed[..]).await.unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn transport_read_headers_positions_stream_at_body() {
        let data: Vec<u8> = [b"Content-Length: 10\r\n\r\n".as_slice(), &[b'a'; 10]].concat();
        let mut reader = &data[..];
        let headers = read_headers(&mut reader).await.unwrap().unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["Content-Length"], "10");

        let mut body = [0u8; 10];
        reader.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"aaaaaaaaaa");
        assert_eq!(reader.len(), 0);
    }

    #[tokio::test]
    async fn transport_unknown_headers_tolerated() {
        let body = br#"{"type":"event","seq":1,"event":"output"}"#;
        let data: Vec<u8> = [
            format!(
                "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
            body.as_slice(),
        ]
        .concat();
        let decoded = read_message(&mut &data[..]).await.unwrap().unwrap();
        match decoded {
            Message::Event(evt) => assert_eq!(evt.event, "output"),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_missing_content_length() {
        let data = b"Content-Type: application/json\r\n\r\n{}";
        let err = read_message(&mut &data[..]).await.unwrap_err();
        assert!(err.to_string().contains("missing Content-Length"), "got: {err}");
    }

    #[tokio::test]
    async fn transport_malformed_header_line() {
        let data = b"NotAHeader\r\n\r\n";
        let err = read_headers(&mut &data[..]).await.unwrap_err();
        assert!(err.to_string().contains("malformed header line"), "got: {err}");
    }

    #[tokio::test]
    async fn transport_eof_mid_headers() {
        let data = b"Content-Length: 10\r\n";
        let err = read_message(&mut &data[..]).await.unwrap_err();
        assert!(
            err.to_string().contains("stream ended inside a header block"),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn transport_eof_mid_body() {
        let data = b"Content-Length: 100\r\n\r\n{\"short\":true}";
        let err = read_message(&mut &data[..]).await.unwrap_err();
        assert!(err.to_string().contains("stream ended mid-body"), "got: {err}");
    }

    #[tokio::test]
    async fn transport_clean_eof_is_none() {
        let data: &[u8] = b"";
        assert!(read_message(&mut &data[..]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transport_empty_body_is_invalid_message() {
        let data = b"Content-Length: 0\r\n\r\n";
        let err = read_message(&mut &data[..]).await.unwrap_err();
        assert!(matches!(err, DapError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn transport_invalid_content_length_value() {
        let data = b"Content-Length: abc\r\n\r\n{}";
        let err = read_message(&mut &data[..]).await.unwrap_err();
        assert!(err.to_string().contains("invalid Content-Length"), "got: {err}");
    }

    #[tokio::test]
    async fn transport_back_to_back_frames() {
        let first = request(1, "initialize");
        let second = Message::Event(Event {
            seq: 2,
            event: "initialized".into(),
            body: None,
        });
        let mut data = encode_message(&first).unwrap();
        data.extend_from_slice(&encode_message(&second).unwrap());

        let mut reader = &data[..];
        assert_eq!(read_message(&mut reader).await.unwrap().unwrap(), first);
        assert_eq!(read_message(&mut reader).await.unwrap().unwrap(), second);
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transport_write_message_readable() {
        let msg = request(7, "attach");
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        let decoded = read_message(&mut &buf[..]).await.unwrap().unwrap();
        assert_eq!(decoded, msg);
    }
}
