use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_NOT_FOUND: &str = "ERR_NOT_FOUND";
pub const ERR_MISSING_DEVICE: &str = "ERR_MISSING_DEVICE";
pub const ERR_UNSUPPORTED_PLATFORM: &str = "ERR_UNSUPPORTED_PLATFORM";
pub const ERR_TRANSFER: &str = "ERR_TRANSFER";
pub const ERR_SPAWN: &str = "ERR_SPAWN";
pub const ERR_PERSISTENCE: &str = "ERR_PERSISTENCE";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_NOT_FOUND, message, trace_id)
    }

    pub fn missing_device(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_MISSING_DEVICE, message, trace_id)
    }

    pub fn unsupported_platform(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_UNSUPPORTED_PLATFORM, message, trace_id)
    }

    pub fn transfer(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TRANSFER, message, trace_id)
    }

    pub fn spawn(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SPAWN, message, trace_id)
    }

    pub fn persistence(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_PERSISTENCE, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
