//! Optional process-wide sender.
//!
//! Nothing in the crate reads the registry; it exists for applications that
//! want one sender configured at start-up and fetched anywhere.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Serialize;

use crate::{
    codec::Timestamp,
    error::{BuildError, SenderError},
    sender::{AsyncSender, FluentSender, SenderConfig},
};

/// The sender installed by [`setup`] or [`setup_async`].
#[derive(Debug)]
pub enum GlobalSender {
    Sync(FluentSender),
    Async(AsyncSender),
}

impl GlobalSender {
    pub fn emit<T: Serialize + ?Sized>(&self, label: &str, data: &T) -> Result<bool, SenderError> {
        match self {
            GlobalSender::Sync(sender) => sender.emit(label, data),
            GlobalSender::Async(sender) => sender.emit(label, data),
        }
    }

    pub fn emit_with_time<T: Serialize + ?Sized>(
        &self,
        label: &str,
        time: impl Into<Timestamp>,
        data: &T,
    ) -> Result<bool, SenderError> {
        match self {
            GlobalSender::Sync(sender) => sender.emit_with_time(label, time, data),
            GlobalSender::Async(sender) => sender.emit_with_time(label, time, data),
        }
    }

    pub fn last_error(&self) -> Option<Arc<SenderError>> {
        match self {
            GlobalSender::Sync(sender) => sender.last_error(),
            GlobalSender::Async(sender) => sender.last_error(),
        }
    }

    /// Close the sender, flushing queued packets.
    pub fn close(&self) {
        match self {
            GlobalSender::Sync(sender) => sender.close(),
            GlobalSender::Async(sender) => sender.close(true),
        }
    }
}

static GLOBAL: Lazy<RwLock<Option<Arc<GlobalSender>>>> = Lazy::new(|| RwLock::new(None));

fn install(sender: GlobalSender) {
    let previous = GLOBAL.write().replace(Arc::new(sender));
    if let Some(previous) = previous {
        previous.close();
    }
}

/// Install a synchronous sender built from `config`, closing any previous one.
pub fn setup(config: SenderConfig) -> Result<(), BuildError> {
    install(GlobalSender::Sync(FluentSender::with_config(config)?));
    Ok(())
}

/// Install an asynchronous sender built from `config`, closing any previous one.
pub fn setup_async(config: SenderConfig) -> Result<(), BuildError> {
    install(GlobalSender::Async(AsyncSender::with_config(config)?));
    Ok(())
}

/// The installed sender, if any.
pub fn get_global_sender() -> Option<Arc<GlobalSender>> {
    GLOBAL.read().clone()
}

/// Remove and close the installed sender.
pub fn close() {
    let previous = GLOBAL.write().take();
    if let Some(previous) = previous {
        previous.close();
    }
}
