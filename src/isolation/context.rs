//! User execution context and the isolation key derived from it

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IsolationError, IsolationResult};

/// Identifies the owner of a connection scope.
///
/// Fields are private so a context cannot be re-pointed at another user once
/// a manager has been built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserExecutionContext {
    user_id: String,
    thread_id: String,
    run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    websocket_connection_id: Option<String>,
    request_id: String,
}

impl UserExecutionContext {
    /// Build a validated context. A fresh `request_id` is generated.
    pub fn new(
        user_id: impl Into<String>,
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> IsolationResult<Self> {
        let context = Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            websocket_connection_id: None,
            request_id: Uuid::new_v4().to_string(),
        };
        context.validate()?;
        Ok(context)
    }

    /// Scope this context to a WebSocket connection
    pub fn with_websocket_connection_id(
        mut self,
        connection_id: impl Into<String>,
    ) -> IsolationResult<Self> {
        self.websocket_connection_id = Some(connection_id.into());
        self.validate()?;
        Ok(self)
    }

    /// Replace the generated request id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> IsolationResult<Self> {
        self.request_id = request_id.into();
        self.validate()?;
        Ok(self)
    }

    /// Check that every required field is present.
    ///
    /// Contexts built through the constructors are always valid; deserialized
    /// ones are re-checked by the factory before use.
    pub fn validate(&self) -> IsolationResult<()> {
        require_non_blank("user_id", &self.user_id)?;
        require_non_blank("thread_id", &self.thread_id)?;
        require_non_blank("run_id", &self.run_id)?;
        require_non_blank("request_id", &self.request_id)?;
        if let Some(ref connection_id) = self.websocket_connection_id {
            require_non_blank("websocket_connection_id", connection_id)?;
        }
        Ok(())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn websocket_connection_id(&self) -> Option<&str> {
        self.websocket_connection_id.as_deref()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn isolation_key(&self) -> IsolationKey {
        IsolationKey::for_context(self)
    }
}

fn require_non_blank(field: &str, value: &str) -> IsolationResult<()> {
    if value.trim().is_empty() {
        return Err(IsolationError::validation(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

/// Lookup key for an active manager: `user_id:connection_id`, or
/// `user_id:request_id` when the context is not bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IsolationKey(String);

impl IsolationKey {
    pub fn for_context(context: &UserExecutionContext) -> Self {
        let scope = context
            .websocket_connection_id()
            .unwrap_or_else(|| context.request_id());
        Self(format!("{}:{}", context.user_id(), scope))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IsolationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IsolationKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for IsolationKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}
