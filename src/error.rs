use crate::types::{InitError, IoError, UpdateError};
use std::fmt;

/// Errors that can occur while driving the Finch core.
#[derive(Debug, thiserror::Error)]
pub enum FinchError {
    #[error("Finch core is not initialized")]
    NotInitialized,

    #[error("Finch core is already initialized")]
    AlreadyInitialized,

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node disconnected")]
    Disconnected,

    #[error("Timeout waiting for node")]
    Timeout,

    #[cfg(feature = "hid")]
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),
}

impl FinchError {
    pub fn illegal(msg: impl Into<String>) -> Self {
        FinchError::IllegalArgument(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        FinchError::Transport(msg.into())
    }

    /// Status reported by `FinchInit`.
    pub fn init_code(&self) -> InitError {
        match self {
            FinchError::NotInitialized => InitError::NotInitialized,
            FinchError::AlreadyInitialized => InitError::AlreadyInitialized,
            FinchError::IllegalArgument(_) => InitError::IllegalArgument,
            _ => InitError::RuntimeError,
        }
    }

    /// Status reported by the update family.
    pub fn update_code(&self) -> UpdateError {
        match self {
            FinchError::NotInitialized => UpdateError::NotInitialized,
            FinchError::IllegalArgument(_) => UpdateError::IllegalArgument,
            _ => UpdateError::RuntimeError,
        }
    }

    /// Status reported by node I/O.
    pub fn io_code(&self) -> IoError {
        match self {
            FinchError::NotInitialized => IoError::NotInitialized,
            FinchError::IllegalArgument(_) => IoError::IllegalArgument,
            _ => IoError::RuntimeError,
        }
    }
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &FinchError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
