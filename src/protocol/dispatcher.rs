use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::core::packet::{Frame, HEARTBEAT_TYPE_CODE, NEGOTIATE_TYPE_CODE};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::transport::Linker;

type HandlerFn = dyn Fn(Frame, &Linker) -> Result<()> + Send + Sync + 'static;

/// Routes inbound frames to handlers by type code.
///
/// Handlers are cloned out of the table before they run, so a handler may
/// register or remove other handlers.
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<i32, Arc<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a typed handler for `T`. The frame is decoded with the linker's parser.
    pub fn register<T, F>(&self, handler: F) -> Result<()>
    where
        T: Message,
        F: Fn(T, &Linker) -> Result<()> + Send + Sync + 'static,
    {
        self.register_raw(T::TYPE_CODE, move |mut frame, linker| {
            let value = linker.parser().from_frame::<T>(&mut frame)?;
            handler(value, linker)
        })
    }

    /// Register a handler receiving the undecoded frame
    pub fn register_raw<F>(&self, type_code: i32, handler: F) -> Result<()>
    where
        F: Fn(Frame, &Linker) -> Result<()> + Send + Sync + 'static,
    {
        if type_code == HEARTBEAT_TYPE_CODE || type_code == NEGOTIATE_TYPE_CODE {
            return Err(ProtocolError::DuplicateTypeCode(type_code));
        }

        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        if handlers.contains_key(&type_code) {
            return Err(ProtocolError::DuplicateTypeCode(type_code));
        }
        handlers.insert(type_code, Arc::new(handler));
        Ok(())
    }

    /// Remove the handler for `type_code`, returning whether one existed
    pub fn unregister(&self, type_code: i32) -> Result<bool> {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;
        Ok(handlers.remove(&type_code).is_some())
    }

    pub fn contains(&self, type_code: i32) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(&type_code))
            .unwrap_or(false)
    }

    /// Invoke the handler registered for the frame's type code
    pub fn dispatch(&self, frame: Frame, linker: &Linker) -> Result<()> {
        let type_code = frame.type_code;
        let handler = {
            let handlers = self.handlers.read().map_err(|_| {
                ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string())
            })?;
            handlers
                .get(&type_code)
                .cloned()
                .ok_or(ProtocolError::UnexpectedMessage(type_code))?
        };

        trace!(type_code, "Dispatching frame");
        handler(frame, linker)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("Dispatcher").field("handlers", &count).finish()
    }
}
