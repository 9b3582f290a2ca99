//! Structured payloads for transfer messages.
//!
//! `FILE_TRANSFER_START` is plain JSON. `FILE_TRANSFER_FRAGMENT` uses a
//! compact binary layout so fragment bytes are never re-encoded:
//!
//! ```text
//! [4 bytes BE: header_len][header_len bytes: JSON {"fragmentId": n}][rest: raw bytes]
//! ```

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Announces an incoming file before its fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferStart {
    pub file_name: String,
    pub file_size: u64,
    pub num_fragments: u32,
}

/// One indexed slice of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFragment {
    pub fragment_id: u32,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FragmentHeader {
    fragment_id: u32,
}

impl FileFragment {
    pub fn new(fragment_id: u32, data: Vec<u8>) -> Self {
        Self { fragment_id, data }
    }

    /// Encodes the fragment into its binary payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let header_json = serde_json::to_vec(&FragmentHeader {
            fragment_id: self.fragment_id,
        })?;
        let header_len = header_json.len() as u32;

        let mut buf = Vec::with_capacity(4 + header_json.len() + self.data.len());
        buf.extend_from_slice(&header_len.to_be_bytes());
        buf.extend_from_slice(&header_json);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Decodes a binary fragment payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::FragmentTooShort);
        }

        let header_len =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        let rest = &payload[4..];
        if rest.len() < header_len {
            return Err(ProtocolError::FragmentHeaderTruncated {
                expected: header_len,
                got: rest.len(),
            });
        }

        let header: FragmentHeader = serde_json::from_slice(&rest[..header_len])?;
        Ok(Self {
            fragment_id: header.fragment_id,
            data: rest[header_len..].to_vec(),
        })
    }
}
