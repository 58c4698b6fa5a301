//! Compact binary codec.
//!
//! Frame layout: `[1 byte kind][4 bytes BE payload length][payload]`.
//!
//! Scalar encodings inside a payload:
//! - strings: `[4 bytes BE length][UTF-8 bytes]`
//! - integers (`message_id`, `fetch_count`, `unread_count`): 4 bytes BE,
//!   zero encodes "absent"
//! - timestamps: 8 bytes IEEE-754 double, seconds since epoch
//! - statuses / flags / list counts: 1 byte
//! - string lists: 1 byte count, then length-prefixed strings
//! - id lists: 1 byte count, then 4-byte BE ids
//!
//! `ChatMessage` payload field order: message_id, username, content,
//! timestamp, recipients, fetch_count, password, active_users, unread_count,
//! message_ids. `ServerResponse` payload: status byte, message,
//! unread_count, data flag, then (flag = 1) a fully framed embedded
//! `ChatMessage`.
//!
//! The extractor requires the 5-byte header before acting, validates the
//! kind byte and the payload length, and on a corrupt header skips past it
//! so the stream resynchronizes instead of stalling.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::{
    ChatMessage, MessageKind, ProtocolError, ServerResponse, Status, WireProtocol,
    MAX_CONTENT_BYTES,
};

const HEADER_LEN: usize = 5;

pub struct BinaryProtocol;

impl WireProtocol for BinaryProtocol {
    fn encode_message(&self, message: &ChatMessage) -> Result<Bytes, ProtocolError> {
        let payload = message_payload(message)?;
        frame(message.kind, &payload)
    }

    fn decode_message(&self, frame: &[u8]) -> Result<ChatMessage, ProtocolError> {
        let (kind, payload) = split_frame(frame)?;
        decode_message_payload(kind, payload)
    }

    fn encode_response(&self, response: &ServerResponse) -> Result<Bytes, ProtocolError> {
        let mut payload = BytesMut::new();
        payload.put_u8(match response.status {
            Status::Success => 0,
            Status::Error => 1,
        });
        put_string(&mut payload, &response.message);
        payload.put_u32(response.unread_count.unwrap_or(0));
        match &response.data {
            Some(data) => {
                payload.put_u8(1);
                payload.extend_from_slice(&self.encode_message(data)?);
            }
            None => payload.put_u8(0),
        }
        frame(MessageKind::ServerResponse, &payload)
    }

    fn decode_response(&self, frame: &[u8]) -> Result<ServerResponse, ProtocolError> {
        let (kind, payload) = split_frame(frame)?;
        if kind != MessageKind::ServerResponse {
            return Err(ProtocolError::InvalidKind(kind.code()));
        }
        let mut reader = Reader::new(payload);
        let status = if reader.u8("status")? == 0 {
            Status::Success
        } else {
            Status::Error
        };
        let message = reader.string("message")?;
        let unread_count = reader.u32("unread_count")?;
        let data = if reader.u8("data flag")? == 1 {
            let embedded = reader.framed_record("embedded record")?;
            Some(self.decode_message(embedded)?)
        } else {
            None
        };
        Ok(ServerResponse {
            status,
            message,
            data,
            unread_count: none_if_zero(unread_count),
        })
    }

    fn extract_frame(&self, buffer: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let kind_byte = buffer[0];
        if MessageKind::from_code(kind_byte).is_none() {
            // Resync past the bad byte; the rest of the buffer is kept.
            buffer.advance(1);
            return Err(ProtocolError::InvalidKind(kind_byte));
        }
        let payload_len =
            u32::from_be_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]) as usize;
        if payload_len > MAX_CONTENT_BYTES {
            buffer.advance(HEADER_LEN);
            return Err(ProtocolError::OversizedFrame(payload_len));
        }
        let total = HEADER_LEN + payload_len;
        if buffer.len() < total {
            return Ok(None);
        }
        Ok(Some(buffer.split_to(total).freeze()))
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn frame(kind: MessageKind, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::OversizedFrame(payload.len()))?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(kind.code());
    out.put_u32(len);
    out.extend_from_slice(payload);
    Ok(out.freeze())
}

fn message_payload(message: &ChatMessage) -> Result<BytesMut, ProtocolError> {
    if message.content.len() > MAX_CONTENT_BYTES {
        return Err(ProtocolError::ContentTooLarge);
    }
    let mut payload = BytesMut::new();
    payload.put_u32(message.message_id.unwrap_or(0));
    put_string(&mut payload, &message.username);
    put_string(&mut payload, &message.content);
    payload.put_f64(encode_timestamp(&message.timestamp));
    put_string_list(
        &mut payload,
        message.recipients.as_deref().unwrap_or(&[]),
        "recipients",
    )?;
    payload.put_u32(message.fetch_count.unwrap_or(0));
    put_string(&mut payload, message.password.as_deref().unwrap_or(""));
    put_string_list(
        &mut payload,
        message.active_users.as_deref().unwrap_or(&[]),
        "active_users",
    )?;
    payload.put_u32(message.unread_count.unwrap_or(0));
    let ids = message.message_ids.as_deref().unwrap_or(&[]);
    let count =
        u8::try_from(ids.len()).map_err(|_| ProtocolError::ListTooLong("message_ids"))?;
    payload.put_u8(count);
    for id in ids {
        payload.put_u32(*id);
    }
    Ok(payload)
}

fn put_string(payload: &mut BytesMut, s: &str) {
    // String lengths use the full 4-byte prefix; only `content` is capped.
    payload.put_u32(s.len() as u32);
    payload.extend_from_slice(s.as_bytes());
}

fn put_string_list(
    payload: &mut BytesMut,
    items: &[String],
    what: &'static str,
) -> Result<(), ProtocolError> {
    let count = u8::try_from(items.len()).map_err(|_| ProtocolError::ListTooLong(what))?;
    payload.put_u8(count);
    for item in items {
        put_string(payload, item);
    }
    Ok(())
}

fn encode_timestamp(timestamp: &DateTime<Utc>) -> f64 {
    // Microsecond resolution survives the double for any realistic epoch.
    timestamp.timestamp() as f64 + f64::from(timestamp.timestamp_subsec_micros()) / 1e6
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn split_frame(frame: &[u8]) -> Result<(MessageKind, &[u8]), ProtocolError> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated("frame header"));
    }
    let kind = MessageKind::from_code(frame[0]).ok_or(ProtocolError::InvalidKind(frame[0]))?;
    let payload_len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
    if frame.len() < HEADER_LEN + payload_len {
        return Err(ProtocolError::Truncated("frame payload"));
    }
    Ok((kind, &frame[HEADER_LEN..HEADER_LEN + payload_len]))
}

fn decode_message_payload(
    kind: MessageKind,
    payload: &[u8],
) -> Result<ChatMessage, ProtocolError> {
    let mut reader = Reader::new(payload);
    let message_id = reader.u32("message_id")?;
    let username = reader.string("username")?;
    let content = reader.string("content")?;
    if content.len() > MAX_CONTENT_BYTES {
        return Err(ProtocolError::ContentTooLarge);
    }
    let timestamp = decode_timestamp(reader.f64("timestamp")?);
    let recipients = reader.string_list("recipients")?;
    let fetch_count = reader.u32("fetch_count")?;
    let password = reader.string("password")?;
    let active_users = reader.string_list("active_users")?;
    let unread_count = reader.u32("unread_count")?;
    let message_ids = reader.id_list("message_ids")?;
    Ok(ChatMessage {
        kind,
        username,
        content,
        timestamp,
        message_id: none_if_zero(message_id),
        recipients: none_if_empty(recipients),
        fetch_count: none_if_zero(fetch_count),
        message_ids: none_if_empty(message_ids),
        password: if password.is_empty() {
            None
        } else {
            Some(password)
        },
        active_users: none_if_empty(active_users),
        unread_count: none_if_zero(unread_count),
    })
}

fn decode_timestamp(seconds: f64) -> DateTime<Utc> {
    let mut whole = seconds.trunc() as i64;
    let mut micros = ((seconds - seconds.trunc()) * 1e6).round() as u32;
    if micros >= 1_000_000 {
        whole += 1;
        micros = 0;
    }
    DateTime::from_timestamp(whole, micros * 1000).unwrap_or(DateTime::UNIX_EPOCH)
}

fn none_if_zero(value: u32) -> Option<u32> {
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

fn none_if_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Sequential reader over one payload; every accessor fails with a
/// `Truncated` error naming the field instead of panicking.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() - self.pos < n {
            return Err(ProtocolError::Truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self, what: &'static str) -> Result<f64, ProtocolError> {
        let b = self.take(8, what)?;
        Ok(f64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self, what: &'static str) -> Result<String, ProtocolError> {
        let len = self.u32(what)? as usize;
        let raw = self.take(len, what)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(what))
    }

    fn string_list(&mut self, what: &'static str) -> Result<Vec<String>, ProtocolError> {
        let count = self.u8(what)?;
        let mut items = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            items.push(self.string(what)?);
        }
        Ok(items)
    }

    fn id_list(&mut self, what: &'static str) -> Result<Vec<u32>, ProtocolError> {
        let count = self.u8(what)?;
        let mut ids = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            ids.push(self.u32(what)?);
        }
        Ok(ids)
    }

    /// Take one embedded `[kind][len][payload]` frame whole.
    fn framed_record(&mut self, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        let remaining = &self.buf[self.pos..];
        if remaining.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated(what));
        }
        let payload_len =
            u32::from_be_bytes([remaining[1], remaining[2], remaining[3], remaining[4]]) as usize;
        self.take(HEADER_LEN + payload_len, what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_dm() -> ChatMessage {
        let mut msg = ChatMessage::new(MessageKind::Dm, "alice", "hello bob")
            .with_recipients(vec!["bob".to_owned()]);
        msg.timestamp = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        msg
    }

    #[test]
    fn message_round_trips() {
        let msg = sample_dm();
        let encoded = BinaryProtocol.encode_message(&msg).unwrap();
        assert_eq!(encoded[0], MessageKind::Dm.code());
        let decoded = BinaryProtocol.decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn message_with_all_optionals_round_trips() {
        let mut msg = ChatMessage::new(MessageKind::Delete, "alice", "")
            .with_recipients(vec!["bob".to_owned()])
            .with_message_ids(vec![3, 9, 27])
            .with_unread_count(2)
            .with_fetch_count(5)
            .with_active_users(vec!["alice".to_owned(), "bob".to_owned()])
            .with_password("hunter2");
        msg.message_id = Some(41);
        msg.timestamp = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 15).unwrap();
        let encoded = BinaryProtocol.encode_message(&msg).unwrap();
        assert_eq!(BinaryProtocol.decode_message(&encoded).unwrap(), msg);
    }

    #[test]
    fn response_with_embedded_message_round_trips() {
        let response = ServerResponse::success("new_message")
            .with_data(sample_dm())
            .with_unread_count(7);
        let encoded = BinaryProtocol.encode_response(&response).unwrap();
        assert_eq!(encoded[0], MessageKind::ServerResponse.code());
        assert_eq!(BinaryProtocol.decode_response(&encoded).unwrap(), response);
    }

    #[test]
    fn error_response_round_trips() {
        let response = ServerResponse::error("Invalid username or password");
        let encoded = BinaryProtocol.encode_response(&response).unwrap();
        assert_eq!(BinaryProtocol.decode_response(&encoded).unwrap(), response);
    }

    #[test]
    fn extractor_waits_for_full_frame() {
        let encoded = BinaryProtocol.encode_message(&sample_dm()).unwrap();
        let mut buffer = BytesMut::new();
        for &byte in &encoded[..encoded.len() - 1] {
            buffer.put_u8(byte);
            assert!(BinaryProtocol.extract_frame(&mut buffer).unwrap().is_none());
        }
        buffer.put_u8(encoded[encoded.len() - 1]);
        let frame = BinaryProtocol.extract_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(frame, encoded);
        assert!(buffer.is_empty());
    }

    #[test]
    fn extractor_skips_invalid_kind_byte() {
        let encoded = BinaryProtocol.encode_message(&sample_dm()).unwrap();
        let mut buffer = BytesMut::new();
        buffer.put_u8(0xFF);
        buffer.extend_from_slice(&encoded);

        assert!(matches!(
            BinaryProtocol.extract_frame(&mut buffer),
            Err(ProtocolError::InvalidKind(0xFF))
        ));
        // The valid frame behind the bad byte is still extractable.
        let frame = BinaryProtocol.extract_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(frame, encoded);
    }

    #[test]
    fn extractor_skips_oversized_header() {
        let mut buffer = BytesMut::new();
        buffer.put_u8(MessageKind::Dm.code());
        buffer.put_u32(u32::try_from(MAX_CONTENT_BYTES).unwrap() + 1);
        let encoded = BinaryProtocol.encode_message(&sample_dm()).unwrap();
        buffer.extend_from_slice(&encoded);

        assert!(matches!(
            BinaryProtocol.extract_frame(&mut buffer),
            Err(ProtocolError::OversizedFrame(_))
        ));
        let frame = BinaryProtocol.extract_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(frame, encoded);
    }

    #[test]
    fn truncated_payload_names_the_field() {
        let encoded = BinaryProtocol.encode_message(&sample_dm()).unwrap();
        // Lie about the payload length: header claims 4 bytes, supplies 4,
        // so the username string length prefix runs off the end.
        let mut corrupt = BytesMut::new();
        corrupt.put_u8(MessageKind::Dm.code());
        corrupt.put_u32(4);
        corrupt.extend_from_slice(&encoded[HEADER_LEN..HEADER_LEN + 4]);
        assert!(matches!(
            BinaryProtocol.decode_message(&corrupt),
            Err(ProtocolError::Truncated("username"))
        ));
    }
}
