use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::command::{Command, TypedCommand};
use super::error::RaftError;

/// Trait for any Raft-compatible state machine.
/// This allows pluggable logic for different types of services (e.g., key-value store, DB, etc.)
///
/// Implementations must be deterministic: the same commands in the same order
/// produce the same state on every server.
pub trait StateMachine: Send + 'static {
    type Command: TypedCommand;

    /// Applies a committed command
    fn apply(&mut self, command: Self::Command);
}

/// Object-safe view of a [`StateMachine`] that decodes its own commands.
trait ErasedStateMachine: Send {
    fn apply_encoded(&mut self, command: &Command) -> Result<(), RaftError>;
}

struct Typed<M>(M);

impl<M: StateMachine> ErasedStateMachine for Typed<M> {
    fn apply_encoded(&mut self, command: &Command) -> Result<(), RaftError> {
        let decoded = M::Command::decode(command)?;
        self.0.apply(decoded);
        Ok(())
    }
}

/// Routes each command to the single state machine registered for its
/// identifier. Built once, before the server starts.
pub struct StateMachineRegistry {
    machines: HashMap<String, Box<dyn ErasedStateMachine>>,
}

impl StateMachineRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.machines.contains_key(identifier)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.machines.keys().map(String::as_str)
    }

    /// Apply a committed command to the machine that owns its identifier
    pub fn apply(&mut self, command: &Command) -> Result<(), RaftError> {
        let machine = self
            .machines
            .get_mut(command.identifier())
            .ok_or_else(|| RaftError::UnknownCommand(command.identifier().to_string()))?;
        machine.apply_encoded(command)
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    machines: HashMap<String, Box<dyn ErasedStateMachine>>,
}

impl RegistryBuilder {
    /// Register `machine` for its command identifier; a second registration
    /// of the same identifier is a configuration error.
    pub fn register<M: StateMachine>(mut self, machine: M) -> Result<Self, RaftError> {
        let identifier = M::Command::IDENTIFIER;
        if self.machines.contains_key(identifier) {
            return Err(RaftError::Configuration(format!(
                "command identifier `{}` is already registered",
                identifier
            )));
        }
        self.machines
            .insert(identifier.to_string(), Box::new(Typed(machine)));
        Ok(self)
    }

    pub fn build(self) -> StateMachineRegistry {
        StateMachineRegistry {
            machines: self.machines,
        }
    }
}

//
// Example Implementation: In-Memory Key-Value Store
//

/// Commands that the key-value store can handle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvCommand {
    Set(String, String),
    Delete(String),
}

impl TypedCommand for KvCommand {
    const IDENTIFIER: &'static str = "kv";
}

/// The in-memory key-value store. Clones share the same map, so a clone kept
/// outside the registry can read what the apply loop writes.
#[derive(Debug, Clone, Default)]
pub struct KeyValueStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl KeyValueStore {
    pub fn get(&self, key: &str) -> Option<String> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateMachine for KeyValueStore {
    type Command = KvCommand;

    fn apply(&mut self, command: Self::Command) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        match command {
            KvCommand::Set(k, v) => {
                data.insert(k, v);
            }
            KvCommand::Delete(k) => {
                data.remove(&k);
            }
        }
    }
}
