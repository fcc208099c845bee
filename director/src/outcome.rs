use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ResultCode;

/// Opaque handle for polling a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaitToken(String);

impl WaitToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WaitToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for WaitToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl fmt::Display for WaitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What every public operation hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub code: ResultCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<WaitToken>,
    /// Resource the operation ended up on, when it picked one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Operation-specific result, such as a BIOS read back from a blade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Outcome {
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            message: String::new(),
            token: None,
            resource: None,
            payload: None,
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ResultCode::GenericFail).with_message(message)
    }

    pub fn pending(token: WaitToken) -> Self {
        Self::new(ResultCode::Pending).with_token(token)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_token(mut self, token: WaitToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn is(&self, code: ResultCode) -> bool {
        self.code == code
    }

    pub fn is_terminal(&self) -> bool {
        self.code.is_terminal()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(ref resource) = self.resource {
            write!(f, " [{}]", resource)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(ref token) = self.token {
            write!(f, " (token {})", token)?;
        }
        Ok(())
    }
}
