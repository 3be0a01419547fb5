// Command handler registry
// Handlers are resolved by command name at dispatch time; unknown names
// are rejected, never silently ignored

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

use farol_api::Command;
use farol_common::HandlerError;

/// Trait for handling typed commands on the receiving target.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// The command name this handler accepts.
    fn can_handle(&self) -> &str;

    async fn handle(&self, command: &Command) -> Result<(), HandlerError>;
}

/// Default handler for unregistered command names.
struct DefaultCommandHandler;

#[async_trait]
impl CommandHandler for DefaultCommandHandler {
    fn can_handle(&self) -> &str {
        "default"
    }

    async fn handle(&self, command: &Command) -> Result<(), HandlerError> {
        warn!("No handler registered for command '{}'", command.name);
        Err(HandlerError::Unsupported(command.name.clone()))
    }
}

/// A simple handler that invokes a closure.
pub struct FnCommandHandler<F>
where
    F: Fn(&Command) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    name: String,
    f: F,
}

impl<F> FnCommandHandler<F>
where
    F: Fn(&Command) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> CommandHandler for FnCommandHandler<F>
where
    F: Fn(&Command) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn can_handle(&self) -> &str {
        &self.name
    }

    async fn handle(&self, command: &Command) -> Result<(), HandlerError> {
        (self.f)(command)
    }
}

/// Registry of command handlers keyed by command name.
pub struct CommandHandlerRegistry {
    handlers: DashMap<String, Arc<dyn CommandHandler>>,
    default_handler: Arc<dyn CommandHandler>,
}

impl Default for CommandHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            default_handler: Arc::new(DefaultCommandHandler),
        }
    }

    /// Register a handler under its own command name. A later
    /// registration for the same name replaces the earlier one.
    pub fn register_handler(&self, handler: Arc<dyn CommandHandler>) {
        let name = handler.can_handle().to_string();
        info!("Registering handler for command '{}'", name);
        self.handlers.insert(name, handler);
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn registered_command_names(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    /// Resolve the handler for `command` and run it.
    pub async fn handle(&self, command: &Command) -> Result<(), HandlerError> {
        let handler = self
            .handlers
            .get(&command.name)
            .map(|e| e.value().clone())
            .unwrap_or_else(|| self.default_handler.clone());
        handler.handle(command).await
    }
}
