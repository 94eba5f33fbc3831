//! Command handler registry
//!
//! Handlers register under their command-type tag at startup; dispatch is a
//! plain map lookup, no reflection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineResult;

use super::executor::CommandView;
use super::{Command, CommandResult};

/// Business logic for one command type
///
/// A handler is a pure function of the transactional view and the command.
/// It may project through the view multiple times; it must not retain the
/// view beyond its return.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        view: &mut CommandView<'_, '_>,
        command: &Command,
    ) -> EngineResult<CommandResult>;
}

/// Startup-time map from command-type tag to handler
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; the last registration for a tag wins
    pub fn register(&mut self, command_type: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let command_type = command_type.into();
        if self.handlers.insert(command_type.clone(), handler).is_some() {
            tracing::warn!(command_type, "replacing previously registered command handler");
        }
    }

    pub fn resolve(&self, command_type: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(command_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
