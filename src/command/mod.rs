//! Command execution
//!
//! One transaction per command: project decision state, invoke the handler
//! resolved from an explicit registry, validate its result, append under the
//! handler's condition, optionally record a command audit row.

mod audit;
mod executor;
mod registry;

use serde::de::DeserializeOwned;

use crate::error::{EngineError, EngineResult};
use crate::event_store::{AppendCondition, AppendEvent};

pub use audit::{CommandAuditStore, CommandRecord};
pub use executor::{CommandExecutor, CommandExecutorBuilder, CommandView, ExecutionResult};
pub use registry::{CommandHandler, CommandRegistry};

/// A command submitted for execution
///
/// The type tag selects the handler; `data` is the serialized domain
/// payload, opaque to the executor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Command {
    pub command_type: String,
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
}

impl Command {
    pub fn new(command_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            command_type: command_type.into(),
            data,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Deserialize the payload into the handler's own command shape
    pub fn parse_data<T: DeserializeOwned>(&self) -> EngineResult<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// What a handler decided: events to stage and the condition they commit under
///
/// An empty `events` list is a precomputed idempotent outcome; the executor
/// then skips the append entirely.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub events: Vec<AppendEvent>,
    pub condition: AppendCondition,
    pub idempotent_reason: Option<String>,
}

impl CommandResult {
    pub fn new(events: Vec<AppendEvent>, condition: AppendCondition) -> Self {
        Self {
            events,
            condition,
            idempotent_reason: None,
        }
    }

    /// Precomputed idempotent outcome with no events to append
    pub fn already_applied(reason: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            condition: AppendCondition::none(),
            idempotent_reason: Some(reason.into()),
        }
    }

    pub(crate) fn validate(&self) -> EngineResult<()> {
        for event in &self.events {
            event.validate().map_err(EngineError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::Tag;

    #[test]
    fn test_command_parse_data() {
        #[derive(serde::Deserialize)]
        struct Payload {
            wallet_id: String,
        }

        let command = Command::new("open_wallet", serde_json::json!({"wallet_id": "w-1"}));
        let payload: Payload = command.parse_data().unwrap();
        assert_eq!(payload.wallet_id, "w-1");

        let bad: EngineResult<Vec<u8>> = command.parse_data();
        assert!(bad.is_err());
    }

    #[test]
    fn test_command_result_validation() {
        let ok = CommandResult::new(
            vec![AppendEvent::new(
                "WalletOpened",
                vec![Tag::new("wallet_id", "w-1")],
                vec![],
            )],
            AppendCondition::none(),
        );
        assert!(ok.validate().is_ok());

        let bad = CommandResult::new(
            vec![AppendEvent::new("", vec![], vec![])],
            AppendCondition::none(),
        );
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_already_applied_has_no_events() {
        let result = CommandResult::already_applied("wallet_exists");
        assert!(result.events.is_empty());
        assert_eq!(result.idempotent_reason.as_deref(), Some("wallet_exists"));
    }
}
