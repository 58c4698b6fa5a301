//! JSON codec: one serde_json object per frame, delimited by a single `\n`.
//!
//! The extractor reads up to the first delimiter; everything after it stays
//! in the buffer. Content size is enforced at both encode and decode so an
//! oversized record is rejected on whichever side sees it first.

use bytes::{Bytes, BytesMut};

use crate::{ChatMessage, ProtocolError, ServerResponse, WireProtocol, MAX_CONTENT_BYTES};

const DELIMITER: u8 = b'\n';

/// Runaway guard for a delimiter-less receive buffer. Sized for the worst
/// case JSON escaping of a `MAX_CONTENT_BYTES` content field.
const MAX_BUFFERED_BYTES: usize = 8 * 1024 * 1024;

pub struct JsonProtocol;

impl WireProtocol for JsonProtocol {
    fn encode_message(&self, message: &ChatMessage) -> Result<Bytes, ProtocolError> {
        if message.content.len() > MAX_CONTENT_BYTES {
            return Err(ProtocolError::ContentTooLarge);
        }
        let mut data = serde_json::to_vec(message)?;
        data.push(DELIMITER);
        Ok(Bytes::from(data))
    }

    fn decode_message(&self, frame: &[u8]) -> Result<ChatMessage, ProtocolError> {
        let message: ChatMessage = serde_json::from_slice(frame)?;
        if message.content.len() > MAX_CONTENT_BYTES {
            return Err(ProtocolError::ContentTooLarge);
        }
        Ok(message)
    }

    fn encode_response(&self, response: &ServerResponse) -> Result<Bytes, ProtocolError> {
        if let Some(data) = &response.data {
            if data.content.len() > MAX_CONTENT_BYTES {
                return Err(ProtocolError::ContentTooLarge);
            }
        }
        let mut data = serde_json::to_vec(response)?;
        data.push(DELIMITER);
        Ok(Bytes::from(data))
    }

    fn decode_response(&self, frame: &[u8]) -> Result<ServerResponse, ProtocolError> {
        let response: ServerResponse = serde_json::from_slice(frame)?;
        if let Some(data) = &response.data {
            if data.content.len() > MAX_CONTENT_BYTES {
                return Err(ProtocolError::ContentTooLarge);
            }
        }
        Ok(response)
    }

    fn extract_frame(&self, buffer: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        match buffer.iter().position(|&b| b == DELIMITER) {
            Some(pos) => {
                let mut frame = buffer.split_to(pos + 1);
                frame.truncate(pos);
                Ok(Some(frame.freeze()))
            }
            None => {
                if buffer.len() > MAX_BUFFERED_BYTES {
                    let dropped = buffer.len();
                    buffer.clear();
                    return Err(ProtocolError::OversizedFrame(dropped));
                }
                Ok(None)
            }
        }
    }
}
