use bytes::{Buf, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::keyvalue::keyvalue_proto::operation::Op;
use crate::keyvalue::keyvalue_proto::{DeleteOperation, Operation, SetOperation};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to decode operation: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Operation without a command")]
    MissingCommand,
}

// A single mutation of the key-value store. Commands travel through the
// replicated log and make up snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

impl Command {
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        Command::Delete { key: key.into() }
    }

    pub fn key(&self) -> &Bytes {
        match self {
            Command::Set { key, .. } => key,
            Command::Delete { key } => key,
        }
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(self.to_proto().encode_to_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Command, CodecError> {
        Command::from_proto(Operation::decode(bytes)?)
    }

    fn to_proto(&self) -> Operation {
        let op = match self {
            Command::Set { key, value } => Op::Set(SetOperation {
                key: key.to_vec(),
                value: value.to_vec(),
            }),
            Command::Delete { key } => Op::Delete(DeleteOperation { key: key.to_vec() }),
        };
        Operation { op: Some(op) }
    }

    fn from_proto(operation: Operation) -> Result<Command, CodecError> {
        match operation.op {
            Some(Op::Set(set)) => Ok(Command::Set {
                key: Bytes::from(set.key),
                value: Bytes::from(set.value),
            }),
            Some(Op::Delete(delete)) => Ok(Command::Delete {
                key: Bytes::from(delete.key),
            }),
            None => Err(CodecError::MissingCommand),
        }
    }
}

// Writes the supplied commands as a sequence of length-delimited operations.
pub fn encode_stream<'a, I>(commands: I) -> Bytes
where
    I: IntoIterator<Item = &'a Command>,
{
    let mut buf = BytesMut::new();
    for command in commands {
        // Writing into a growable buffer cannot run out of space.
        command
            .to_proto()
            .encode_length_delimited(&mut buf)
            .unwrap_or_default();
    }
    buf.freeze()
}

// Reads back a sequence written by encode_stream. Fails on the first record
// which cannot be decoded, including a truncated trailing record.
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Command>, CodecError> {
    let mut buf = bytes;
    let mut result = Vec::new();
    while buf.has_remaining() {
        let operation = Operation::decode_length_delimited(&mut buf)?;
        result.push(Command::from_proto(operation)?);
    }
    Ok(result)
}
