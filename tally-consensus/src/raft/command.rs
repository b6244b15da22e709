use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::RaftError;

/// An opaque, encoded command as stored in the log.
///
/// The identifier selects the state machine (and codec) that understands the
/// payload; the consensus core never looks inside it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    identifier: String,
    payload: Bytes,
}

impl Command {
    pub fn new(identifier: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            identifier: identifier.into(),
            payload: payload.into(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("identifier", &self.identifier)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A typed application command with a stable identifier.
///
/// The default codec is bincode; implementors only pick the identifier.
pub trait TypedCommand: Serialize + DeserializeOwned + Send + 'static {
    const IDENTIFIER: &'static str;

    fn encode(&self) -> Result<Command, RaftError> {
        let payload = bincode::serialize(self)?;
        Ok(Command::new(Self::IDENTIFIER, payload))
    }

    fn decode(command: &Command) -> Result<Self, RaftError> {
        if command.identifier() != Self::IDENTIFIER {
            return Err(RaftError::UnknownCommand(command.identifier().to_string()));
        }
        Ok(bincode::deserialize(command.payload())?)
    }
}
