//! Control-message envelopes.
//!
//! Every protocol message is a keyed dictionary carried as an XML property
//! list. `Envelope` wraps the dictionary with typed accessors so dispatch
//! code never handles raw nodes.

use std::io::Cursor;

use plist::{Dictionary, Integer, Value};
use thiserror::Error;

use crate::protocol::{AsrCommand, DataType, MessageKind};

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("missing field \"{field}\"")]
    MissingField { field: &'static str },

    #[error("field \"{field}\" has the wrong type")]
    WrongType { field: &'static str },

    #[error("document root is not a dictionary")]
    NotADictionary,

    #[error("codec error: {0}")]
    Codec(#[from] plist::Error),
}

/// One structured control message.
#[derive(Debug, Clone, Default)]
pub struct Envelope(Dictionary);

impl Envelope {
    pub fn new() -> Self {
        Self(Dictionary::new())
    }

    pub fn from_dictionary(dict: Dictionary) -> Self {
        Self(dict)
    }

    /// Decode from an XML property-list document.
    pub fn from_xml(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value = Value::from_reader_xml(Cursor::new(bytes))?;
        match value {
            Value::Dictionary(dict) => Ok(Self(dict)),
            _ => Err(EnvelopeError::NotADictionary),
        }
    }

    /// Encode as an XML property-list document.
    pub fn to_xml(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut buf = Vec::new();
        Value::Dictionary(self.0.clone()).to_writer_xml(&mut buf)?;
        Ok(buf)
    }

    pub fn insert_string(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), Value::String(value.into()));
    }

    pub fn insert_uint(&mut self, key: &str, value: u64) {
        self.0
            .insert(key.to_string(), Value::Integer(Integer::from(value)));
    }

    pub fn insert_data(&mut self, key: &str, value: Vec<u8>) {
        self.0.insert(key.to_string(), Value::Data(value));
    }

    pub fn insert_dict(&mut self, key: &str, value: Envelope) {
        self.0.insert(key.to_string(), Value::Dictionary(value.0));
    }

    /// Raw value access, for callers that walk non-message structures.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn string(&self, field: &'static str) -> Result<&str, EnvelopeError> {
        self.0
            .get(field)
            .ok_or(EnvelopeError::MissingField { field })?
            .as_string()
            .ok_or(EnvelopeError::WrongType { field })
    }

    pub fn uint(&self, field: &'static str) -> Result<u64, EnvelopeError> {
        self.0
            .get(field)
            .ok_or(EnvelopeError::MissingField { field })?
            .as_unsigned_integer()
            .ok_or(EnvelopeError::WrongType { field })
    }

    pub fn data(&self, field: &'static str) -> Result<&[u8], EnvelopeError> {
        self.0
            .get(field)
            .ok_or(EnvelopeError::MissingField { field })?
            .as_data()
            .ok_or(EnvelopeError::WrongType { field })
    }

    pub fn dict(&self, field: &'static str) -> Result<&Dictionary, EnvelopeError> {
        self.0
            .get(field)
            .ok_or(EnvelopeError::MissingField { field })?
            .as_dictionary()
            .ok_or(EnvelopeError::WrongType { field })
    }

    /// Message kind from the `MsgType` discriminant.
    pub fn message_kind(&self) -> Result<MessageKind, EnvelopeError> {
        Ok(MessageKind::from(self.string("MsgType")?))
    }

    /// Data-request selector from the `DataType` field.
    pub fn data_type(&self) -> Result<DataType, EnvelopeError> {
        Ok(DataType::from(self.string("DataType")?))
    }

    /// ASR command, if the envelope carries a string `Command` field.
    ///
    /// Envelopes without one are tolerated during negotiation, so absence
    /// is not an error here.
    pub fn asr_command(&self) -> Option<AsrCommand> {
        self.0
            .get("Command")
            .and_then(Value::as_string)
            .map(AsrCommand::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_round_trip() {
        let mut payload = Envelope::new();
        payload.insert_uint("Port", 1);
        payload.insert_uint("Size", 3000);

        let mut env = Envelope::new();
        env.insert_string("Command", "OOBData");
        env.insert_uint("OOB Length", 200);
        env.insert_data("Blob", vec![0xde, 0xad, 0xbe, 0xef]);
        env.insert_dict("Payload", payload);

        let xml = env.to_xml().unwrap();
        let decoded = Envelope::from_xml(&xml).unwrap();

        assert_eq!(decoded.string("Command").unwrap(), "OOBData");
        assert_eq!(decoded.uint("OOB Length").unwrap(), 200);
        assert_eq!(decoded.data("Blob").unwrap(), &[0xde, 0xad, 0xbe, 0xef]);
        let inner = decoded.dict("Payload").unwrap();
        assert_eq!(inner.get("Size").unwrap().as_unsigned_integer(), Some(3000));
    }

    #[test]
    fn test_missing_field() {
        let env = Envelope::new();
        assert!(matches!(
            env.uint("OOB Offset"),
            Err(EnvelopeError::MissingField { field: "OOB Offset" })
        ));
    }

    #[test]
    fn test_wrong_type() {
        let mut env = Envelope::new();
        env.insert_string("OOB Length", "not a number");
        assert!(matches!(
            env.uint("OOB Length"),
            Err(EnvelopeError::WrongType { field: "OOB Length" })
        ));
    }

    #[test]
    fn test_asr_command_absent_is_tolerated() {
        let env = Envelope::new();
        assert!(env.asr_command().is_none());

        let mut env = Envelope::new();
        env.insert_uint("Command", 7);
        assert!(env.asr_command().is_none());
    }

    #[test]
    fn test_message_kind_accessor() {
        let mut env = Envelope::new();
        env.insert_string("MsgType", "DataRequestMsg");
        env.insert_string("DataType", "KernelCache");
        assert_eq!(
            env.message_kind().unwrap(),
            crate::protocol::MessageKind::DataRequest
        );
        assert_eq!(
            env.data_type().unwrap(),
            crate::protocol::DataType::KernelCache
        );
    }
}
