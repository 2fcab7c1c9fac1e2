//! Command dispatch -- maps a frame's command code to its handler.
//!
//! Commands are registered once at startup; a second registration for the
//! same code is refused. Each inbound frame runs its handler on its own
//! task so a slow handler never stalls the connection's read loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use gossipnet_protocol::{Frame, Header, CMD_HANDSHAKE};

use crate::connection::Connection;
use crate::mini_protocols;
use crate::Engine;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One inbound frame plus the context a handler needs to reply.
pub struct Request {
    pub engine: Engine,
    pub connection: Arc<Connection>,
    pub header: Header,
    pub payload: Bytes,
}

pub type CustomHandler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// A registered handler: one of the built-in protocols or application code.
#[derive(Clone)]
pub enum CommandHandler {
    Ping,
    ExchangePeerList,
    Custom(CustomHandler),
}

impl CommandHandler {
    pub fn custom<F, Fut>(f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        CommandHandler::Custom(Arc::new(move |req| Box::pin(f(req))))
    }

    fn invoke(&self, req: Request) -> HandlerFuture {
        match self {
            CommandHandler::Ping => Box::pin(mini_protocols::handle_ping(req)),
            CommandHandler::ExchangePeerList => Box::pin(mini_protocols::handle_peer_list(req)),
            CommandHandler::Custom(f) => f(req),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("command code {code} already registered as {existing:?}")]
    DuplicateCommand { code: u8, existing: String },
    #[error("command code {0} is reserved for the handshake")]
    Reserved(u8),
}

/// What [`CommandTable::process`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Spawned,
    LengthMismatch,
    UnknownCommand,
    ShuttingDown,
}

struct RegisteredCommand {
    name: String,
    handler: CommandHandler,
}

#[derive(Default)]
pub struct CommandTable {
    commands: RwLock<HashMap<u8, RegisteredCommand>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        code: u8,
        handler: CommandHandler,
    ) -> Result<(), DispatchError> {
        if code == CMD_HANDSHAKE {
            tracing::warn!(name, code, "attempt to register handler for handshake code");
            return Err(DispatchError::Reserved(code));
        }

        let mut commands = self.commands.write().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = commands.get(&code) {
            tracing::warn!(
                name,
                code,
                existing = %existing.name,
                "attempt to add duplicate command handler"
            );
            return Err(DispatchError::DuplicateCommand {
                code,
                existing: existing.name.clone(),
            });
        }

        commands.insert(
            code,
            RegisteredCommand {
                name: name.to_string(),
                handler,
            },
        );
        tracing::debug!(name, code, "command registered");
        Ok(())
    }

    pub fn name(&self, code: u8) -> Option<String> {
        self.read().get(&code).map(|c| c.name.clone())
    }

    pub fn contains(&self, code: u8) -> bool {
        self.read().contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn handler(&self, code: u8) -> Option<CommandHandler> {
        self.read().get(&code).map(|c| c.handler.clone())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u8, RegisteredCommand>> {
        self.commands.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Route one inbound frame from `connection` to its handler.
    ///
    /// The declared length is re-checked against the payload; inconsistent
    /// frames and unknown codes are dropped.
    pub fn process(&self, engine: &Engine, connection: Arc<Connection>, frame: Frame) -> Dispatch {
        if !frame.is_consistent() {
            tracing::debug!(
                peer = %connection.peer_id().short(),
                declared = frame.header.data_length,
                actual = frame.payload.len(),
                "dispatch: length mismatch, frame dropped"
            );
            return Dispatch::LengthMismatch;
        }

        let Some(handler) = self.handler(frame.command()) else {
            engine.stats().record_unknown_command();
            tracing::debug!(
                peer = %connection.peer_id().short(),
                command = frame.command(),
                "dispatch: unknown command"
            );
            return Dispatch::UnknownCommand;
        };

        let req = Request {
            engine: engine.clone(),
            connection,
            header: frame.header,
            payload: frame.payload,
        };
        if engine.spawn(handler.invoke(req)) {
            engine.stats().record_frame_dispatched();
            Dispatch::Spawned
        } else {
            Dispatch::ShuttingDown
        }
    }
}
