//! Typed service operations
//!
//! Wrappers over [`ServiceSession::invoke`] for the built-in capabilities.
//! Page keys pass through untouched, plugin failures become
//! [`FetchOutcome::Failure`], and a missing capability is reported as
//! [`FetchError::FeatureAbsent`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::engine::EngineError;
use super::features::Capability;
use super::session::{ServiceSession, SessionError};
use super::types::{Comment, PageKey, PagedResult, Post, ServiceConfig, User};

/// Name guests give errors for methods they do not implement
pub const UNSUPPORTED_ERROR: &str = "UnsupportedOperation";

/// Why a fetch produced no value
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchError {
    #[error("Service does not provide the '{capability}' capability")]
    FeatureAbsent { capability: Capability },

    #[error("Operation not supported by this service: {message}")]
    Unsupported { message: String },

    #[error("Service error ({name}): {message}")]
    Plugin { name: String, message: String },

    #[error("Invalid response from service: {message}")]
    InvalidResponse { message: String },

    #[error("Service call timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Session error: {message}")]
    Session { message: String },
}

impl From<SessionError> for FetchError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Engine(EngineError::Guest { name, message }) => {
                if name == UNSUPPORTED_ERROR {
                    FetchError::Unsupported { message }
                } else {
                    FetchError::Plugin { name, message }
                }
            }
            SessionError::Engine(EngineError::Marshal(message)) => {
                FetchError::InvalidResponse { message }
            }
            SessionError::Timeout(limit) => timeout_error(limit),
            other => FetchError::Session {
                message: other.to_string(),
            },
        }
    }
}

/// Result of a fetch, as handed to content consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome<T> {
    Success {
        value: T,
        /// False when served from a local cache. Informational only.
        #[serde(rename = "isRemote")]
        is_remote: bool,
    },
    Failure {
        error: FetchError,
    },
    Loading,
}

impl<T> FetchOutcome<T> {
    pub fn remote(value: T) -> Self {
        FetchOutcome::Success {
            value,
            is_remote: true,
        }
    }

    pub fn cached(value: T) -> Self {
        FetchOutcome::Success {
            value,
            is_remote: false,
        }
    }

    pub fn failure(error: FetchError) -> Self {
        FetchOutcome::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            FetchOutcome::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            FetchOutcome::Failure { error } => Some(error),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<T, FetchError> {
        match self {
            FetchOutcome::Success { value, .. } => Ok(value),
            FetchOutcome::Failure { error } => Err(error),
            FetchOutcome::Loading => Err(FetchError::Session {
                message: "fetch still loading".to_string(),
            }),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> FetchOutcome<U> {
        match self {
            FetchOutcome::Success { value, is_remote } => FetchOutcome::Success {
                value: f(value),
                is_remote,
            },
            FetchOutcome::Failure { error } => FetchOutcome::Failure { error },
            FetchOutcome::Loading => FetchOutcome::Loading,
        }
    }
}

impl<T> From<Result<T, FetchError>> for FetchOutcome<T> {
    fn from(result: Result<T, FetchError>) -> Self {
        match result {
            Ok(value) => FetchOutcome::remote(value),
            Err(error) => FetchOutcome::failure(error),
        }
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, FetchError> {
    serde_json::from_value(value).map_err(|e| FetchError::InvalidResponse {
        message: e.to_string(),
    })
}

fn key_arg(key: Option<PageKey>) -> Value {
    key.map(|k| serde_json::to_value(k).unwrap_or(Value::Null))
        .unwrap_or(Value::Null)
}

/// Verdict returned by a guest validator for one config key
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfigFailure {
    pub key: String,
    #[serde(default, alias = "reason")]
    pub message: String,
}

impl ServiceSession {
    async fn call<T: DeserializeOwned>(
        &self,
        capability: Capability,
        method: &str,
        args: Vec<Value>,
    ) -> FetchOutcome<T> {
        let result = self
            .invoke(&capability, method, args)
            .await
            .and_then(decode::<T>);
        FetchOutcome::from(result)
    }

    /// Latest posts, starting at `key` (`None` for the first page)
    pub async fn fetch_latest(&self, key: Option<PageKey>) -> FetchOutcome<PagedResult<Post>> {
        self.call(Capability::Post, "getLatest", vec![key_arg(key)]).await
    }

    /// Fresh first page of the latest posts
    pub async fn fetch_fresh(&self) -> FetchOutcome<PagedResult<Post>> {
        self.fetch_latest(None).await
    }

    pub async fn fetch_post(&self, id: &str) -> FetchOutcome<Post> {
        self.call(Capability::Post, "getPost", vec![Value::String(id.to_string())])
            .await
    }

    pub async fn fetch_comments(
        &self,
        post_id: &str,
        key: Option<PageKey>,
    ) -> FetchOutcome<PagedResult<Comment>> {
        self.call(
            Capability::Post,
            "getComments",
            vec![Value::String(post_id.to_string()), key_arg(key)],
        )
        .await
    }

    pub async fn search(&self, query: &str, key: Option<PageKey>) -> FetchOutcome<PagedResult<Post>> {
        self.call(
            Capability::Post,
            "search",
            vec![Value::String(query.to_string()), key_arg(key)],
        )
        .await
    }

    pub async fn fetch_user(&self, id: &str) -> FetchOutcome<User> {
        self.call(Capability::User, "getUser", vec![Value::String(id.to_string())])
            .await
    }

    pub async fn fetch_user_by_url(&self, url: &str) -> FetchOutcome<User> {
        self.call(Capability::User, "getUserByUrl", vec![Value::String(url.to_string())])
            .await
    }

    pub async fn fetch_user_posts(
        &self,
        user_id: &str,
        key: Option<PageKey>,
    ) -> FetchOutcome<PagedResult<Post>> {
        self.call(
            Capability::User,
            "getPosts",
            vec![Value::String(user_id.to_string()), key_arg(key)],
        )
        .await
    }

    /// Run the service's own config validator.
    ///
    /// A null result means every config passed; otherwise one failure or a
    /// list of failures is returned.
    pub async fn validate_configs(
        &self,
        configs: &[ServiceConfig],
    ) -> Result<Vec<ConfigFailure>, FetchError> {
        let args = serde_json::to_value(configs).map_err(|e| FetchError::InvalidResponse {
            message: e.to_string(),
        })?;
        let value = self.invoke(&Capability::Validate, "validate", vec![args]).await?;

        match value {
            Value::Null => Ok(Vec::new()),
            Value::Array(_) => decode(value),
            Value::Object(_) => decode::<ConfigFailure>(value).map(|f| vec![f]),
            other => Err(FetchError::InvalidResponse {
                message: format!("unexpected validator result: {}", other),
            }),
        }
    }
}

/// Convenience for timeouts reported by [`FetchError::Timeout`]
pub fn timeout_error(limit: Duration) -> FetchError {
    FetchError::Timeout {
        millis: limit.as_millis() as u64,
    }
}
