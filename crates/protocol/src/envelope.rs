use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::ProtocolError;
use crate::constants::MessageType;
use crate::messages::{FileFragment, FileTransferStart};

/// A single protocol message: type tag plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a message with raw payload bytes.
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Creates a message with no payload.
    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, Vec::new())
    }

    /// Creates a message whose payload is a UTF-8 file name.
    pub fn with_name(msg_type: MessageType, name: &str) -> Self {
        Self::new(msg_type, name.as_bytes().to_vec())
    }

    /// Creates a message with a JSON-encoded payload.
    pub fn with_json<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(msg_type, serde_json::to_vec(payload)?))
    }

    /// Builds a `FILE_TRANSFER_START` message.
    pub fn transfer_start(start: &FileTransferStart) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::FileTransferStart, start)
    }

    /// Builds a `FILE_TRANSFER_FRAGMENT` message.
    pub fn fragment(fragment: &FileFragment) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::FileTransferFragment,
            fragment.encode()?,
        ))
    }

    /// Reads the payload as a file name.
    pub fn name(&self) -> Result<String, ProtocolError> {
        Ok(String::from_utf8(self.payload.clone())?)
    }

    /// Deserializes a JSON payload.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decodes a `FILE_TRANSFER_START` payload.
    pub fn parse_transfer_start(&self) -> Result<FileTransferStart, ProtocolError> {
        self.parse_json()
    }

    /// Decodes a `FILE_TRANSFER_FRAGMENT` payload.
    pub fn parse_fragment(&self) -> Result<FileFragment, ProtocolError> {
        FileFragment::decode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_payload() {
        let msg = Message::with_name(MessageType::RequestDownload, "mesh.[abc123].fbx");
        assert_eq!(msg.msg_type, MessageType::RequestDownload);
        assert_eq!(msg.name().unwrap(), "mesh.[abc123].fbx");
    }

    #[test]
    fn empty_payload() {
        let msg = Message::empty(MessageType::UploadComplete);
        assert!(msg.payload.is_empty());
        assert_eq!(msg.name().unwrap(), "");
    }

    #[test]
    fn invalid_utf8_name() {
        let msg = Message::new(MessageType::RequestUpload, vec![0xff, 0xfe]);
        assert!(matches!(msg.name(), Err(ProtocolError::InvalidUtf8(_))));
    }

    #[test]
    fn transfer_start_payload() {
        let start = FileTransferStart {
            file_name: "a.[h].bin".into(),
            file_size: 42,
            num_fragments: 1,
        };
        let msg = Message::transfer_start(&start).unwrap();
        assert_eq!(msg.msg_type, MessageType::FileTransferStart);
        assert_eq!(msg.parse_transfer_start().unwrap(), start);
    }

    #[test]
    fn malformed_json_rejected() {
        let msg = Message::new(MessageType::FileTransferStart, b"{not json".to_vec());
        assert!(matches!(
            msg.parse_transfer_start(),
            Err(ProtocolError::Json(_))
        ));
    }
}
