//! Transport-neutral encoding of [`Message`]s.
//!
//! Each message kind is keyed by its stable identifier in a
//! [`MessageRegistry`] that is built once and never mutated afterwards.

use bytes::Bytes;
use std::collections::HashMap;
use tally_common::types::{NodeId, Term};

use super::error::RaftError;
use super::message::{Message, MessageKind, Payload};

/// An encoded message: the kind identifier plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedObject {
    identifier: String,
    body: Bytes,
}

impl EncodedObject {
    pub fn new(identifier: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            identifier: identifier.into(),
            body: body.into(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Converts between in-memory messages and their encoded form.
pub trait Encoder: Send + Sync {
    fn encode(&self, message: &Message) -> Result<EncodedObject, RaftError>;
    fn decode(&self, encoded: &EncodedObject) -> Result<Message, RaftError>;
}

type EncodeFn = fn(&Message) -> Result<Bytes, RaftError>;
type DecodeFn = fn(&[u8]) -> Result<Message, RaftError>;

#[derive(Clone, Copy)]
struct KindCodec {
    encode: EncodeFn,
    decode: DecodeFn,
}

fn encode_body<T: serde::Serialize>(message: &Message, body: &T) -> Result<Bytes, RaftError> {
    let bytes = bincode::serialize(&(&message.sender_id, message.term, body))?;
    Ok(Bytes::from(bytes))
}

fn payload_mismatch(expected: MessageKind, message: &Message) -> RaftError {
    RaftError::Codec(format!(
        "codec for {} given a {} message",
        expected,
        message.kind()
    ))
}

macro_rules! kind_codec {
    ($variant:ident) => {
        KindCodec {
            encode: |message| match &message.payload {
                Payload::$variant(body) => encode_body(message, body),
                _ => Err(payload_mismatch(MessageKind::$variant, message)),
            },
            decode: |bytes| {
                let (sender_id, term, body): (NodeId, Term, _) = bincode::deserialize(bytes)?;
                Ok(Message {
                    sender_id,
                    term,
                    payload: Payload::$variant(body),
                })
            },
        }
    };
}

/// Immutable map from kind identifier to its encode/decode functions.
#[derive(Clone)]
pub struct MessageRegistry {
    codecs: HashMap<&'static str, KindCodec>,
}

impl MessageRegistry {
    /// Registry with every message kind the core speaks
    pub fn new() -> Self {
        Self::with_kinds(&MessageKind::ALL)
    }

    /// Registry restricted to `kinds`; other identifiers fail to encode or decode
    pub fn with_kinds(kinds: &[MessageKind]) -> Self {
        let codecs = kinds
            .iter()
            .map(|kind| {
                let codec = match kind {
                    MessageKind::VoteRequest => kind_codec!(VoteRequest),
                    MessageKind::VoteResponse => kind_codec!(VoteResponse),
                    MessageKind::AppendRequest => kind_codec!(AppendRequest),
                    MessageKind::AppendResponse => kind_codec!(AppendResponse),
                    MessageKind::CommandRequest => kind_codec!(CommandRequest),
                    MessageKind::CommandResponse => kind_codec!(CommandResponse),
                };
                (kind.identifier(), codec)
            })
            .collect();
        Self { codecs }
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.codecs.contains_key(identifier)
    }

    fn codec(&self, identifier: &str) -> Result<KindCodec, RaftError> {
        self.codecs
            .get(identifier)
            .copied()
            .ok_or_else(|| RaftError::UnknownMessageKind(identifier.to_string()))
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Default [`Encoder`]: bincode bodies dispatched through a [`MessageRegistry`].
#[derive(Clone, Default)]
pub struct BincodeEncoder {
    registry: MessageRegistry,
}

impl BincodeEncoder {
    pub fn new(registry: MessageRegistry) -> Self {
        Self { registry }
    }
}

impl Encoder for BincodeEncoder {
    fn encode(&self, message: &Message) -> Result<EncodedObject, RaftError> {
        let identifier = message.kind().identifier();
        let codec = self.registry.codec(identifier)?;
        let body = (codec.encode)(message)?;
        Ok(EncodedObject::new(identifier, body))
    }

    fn decode(&self, encoded: &EncodedObject) -> Result<Message, RaftError> {
        let codec = self.registry.codec(encoded.identifier())?;
        (codec.decode)(encoded.body())
    }
}
