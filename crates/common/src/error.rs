use {serde::Serialize, thiserror::Error};

use crate::envelope::Envelope;

/// Coarse classification of bus errors, used for routing notifications and
/// picking a log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Adapter,
    Activation,
    Strategy,
    Scheduler,
    NonDelivered,
    Pipeline,
    Cancelled,
    Channel,
    Codec,
    Other,
}

/// Log level a handled error is reported at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    /// Extraction from or delivery to a physical location failed.
    #[error("adapter {adapter} failed: {message}")]
    Adapter { adapter: String, message: String },

    /// No handler matched, or the handler itself failed.
    #[error("activation failed on endpoint {endpoint}: {message}")]
    Activation { endpoint: String, message: String },

    #[error("{strategy} strategy failed: {message}")]
    Strategy { strategy: String, message: String },

    /// The router found neither a matching rule nor a fallback channel.
    #[error("no route for message {message_id}")]
    Unroutable { message_id: String },

    #[error("scheduled item {item} failed: {message}")]
    Scheduler { item: String, message: String },

    /// Delivery retries were exhausted. The envelope travels with the error so
    /// the caller can still recover it.
    #[error("message {message_id} not delivered after {attempts} attempt(s): {reason}")]
    NonDelivered {
        message_id: String,
        attempts: u32,
        reason: String,
        forwarded_to: Option<String>,
        envelope: Box<Envelope>,
    },

    #[error("pipeline stage {stage} failed: {message}")]
    Pipeline { stage: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("channel {channel}: {message}")]
    Channel { channel: String, message: String },

    #[error("codec error: {message}")]
    Codec { message: String },

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn adapter(adapter: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Adapter {
            adapter: adapter.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn activation(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Activation {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn strategy(strategy: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Strategy {
            strategy: strategy.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unroutable(message_id: impl Into<String>) -> Self {
        Self::Unroutable {
            message_id: message_id.into(),
        }
    }

    #[must_use]
    pub fn scheduler(item: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Scheduler {
            item: item.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn pipeline(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Pipeline {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn channel(channel: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn codec(message: impl std::fmt::Display) -> Self {
        Self::Codec {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn non_delivered(
        envelope: Envelope,
        attempts: u32,
        reason: impl std::fmt::Display,
        forwarded_to: Option<String>,
    ) -> Self {
        Self::NonDelivered {
            message_id: envelope.header.message_id().to_string(),
            attempts,
            reason: reason.to_string(),
            forwarded_to,
            envelope: Box::new(envelope),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Adapter { .. } => ErrorKind::Adapter,
            Self::Activation { .. } => ErrorKind::Activation,
            Self::Strategy { .. } | Self::Unroutable { .. } => ErrorKind::Strategy,
            Self::Scheduler { .. } => ErrorKind::Scheduler,
            Self::NonDelivered { .. } => ErrorKind::NonDelivered,
            Self::Pipeline { .. } => ErrorKind::Pipeline,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Channel { .. } => ErrorKind::Channel,
            Self::Codec { .. } | Self::Json(_) => ErrorKind::Codec,
            Self::Message(_) | Self::Io(_) => ErrorKind::Other,
        }
    }

    pub fn severity(&self) -> Severity {
        match self.kind() {
            ErrorKind::Cancelled => Severity::Debug,
            ErrorKind::Pipeline | ErrorKind::Strategy => Severity::Warn,
            ErrorKind::NonDelivered => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Errors that fail the same way on every attempt, such as an envelope the
    /// codec cannot encode.
    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Codec
    }

    /// True for errors the adapter loop treats as benign.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Recover the envelope carried by a [`Error::NonDelivered`].
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            Self::NonDelivered { envelope, .. } => Some(*envelope),
            _ => None,
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Shared context trait ────────────────────────────────────────────────────

/// Trait for error types that can be constructed from a plain message string.
///
/// Implement this for your crate's error type, then invoke [`impl_context!`]
/// in your error module to get `.context()` and `.with_context()` on `Result`
/// and `Option`.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Generate a crate-local `Context` trait with `.context()` and `.with_context()`
/// methods on `Result` and `Option`.
///
/// Invoke inside a module that defines `Error: FromMessage` and
/// `type Result<T> = std::result::Result<T, Error>`.
///
/// ```ignore
/// // in crates/foo/src/error.rs
/// switchyard_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                let ctx = context.into();
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    let ctx = f().into();
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}
