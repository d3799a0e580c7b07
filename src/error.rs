//! Error type of the runtime crate.
//!
//! `KaraboError` consolidates everything that can go wrong between the broker
//! and a device's slot handler. Using `thiserror`, data model failures convert
//! with `?` through the `Core` variant.
//!
//! ## Recoverability
//!
//! Most variants are local recoveries: they surface to the caller of a slot as
//! a failure reply and never take down the process. Only [`KaraboError::BrokerUnavailable`]
//! after the reconnect ceiling, [`KaraboError::Config`] at bootstrap and
//! [`KaraboError::Io`] on listening sockets are treated as fatal by the binaries;
//! see [`KaraboError::is_recoverable`].
//!
//! ## Remote failures
//!
//! A slot that fails replies with `(message, details)`. The requesting side
//! rebuilds a [`KaraboError::Remote`] from the reply so that `?` propagates it
//! like any local error.

use karabo_core::{CoreError, State};
use thiserror::Error;

/// Convenience alias for results using the runtime error type.
pub type KaraboResult<T> = std::result::Result<T, KaraboError>;

/// Errors raised by the runtime.
#[derive(Error, Debug)]
pub enum KaraboError {
    /// Undecodable message or unknown addressing; logged and dropped.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Hash access, codec or schema construction failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Schema validation rejected a configuration.
    #[error("{0}")]
    Validation(String),

    /// Slot or property write rejected in the current state.
    #[error("Action '{action}' is not allowed in state '{state}'")]
    AllowedStateViolation {
        /// Slot name or property path.
        action: String,
        /// State at the time of the call.
        state: State,
    },

    /// No reply arrived within the timeout.
    #[error("Request of '{slot}' on '{target}' timed out after {timeout_ms} ms")]
    RequestTimeout {
        /// Addressed instance.
        target: String,
        /// Addressed slot.
        slot: String,
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// A wait was cancelled before completion.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The remote slot failed.
    #[error("Remote error: {message}")]
    Remote {
        /// One-line failure text.
        message: String,
        /// Extended failure details, possibly empty.
        details: String,
    },

    /// A pipeline input could not keep up.
    #[error("Pipeline overflow on '{channel}': {reason}")]
    PipelineOverflow {
        /// Channel id.
        channel: String,
        /// What was dropped or why it blocked.
        reason: String,
    },

    /// The broker cannot be reached.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Device construction or `initialize` failed.
    #[error("Device '{device_id}' failed to initialize: {reason}")]
    DeviceInit {
        /// Device that failed.
        device_id: String,
        /// Failure text.
        reason: String,
    },

    /// A device ignored `slotKillDevice` for longer than the grace.
    #[error("Device '{device_id}' did not shut down within {grace_secs} s")]
    UncancelledShutdown {
        /// Device that hung.
        device_id: String,
        /// Grace that expired.
        grace_secs: u64,
    },

    /// The addressed slot is not registered.
    #[error("'{instance_id}' has no slot '{slot}'")]
    SlotNotFound {
        /// Instance that received the call.
        instance_id: String,
        /// Unknown slot.
        slot: String,
    },

    /// Another live instance already uses this id.
    #[error("{0} already instantiated and alive")]
    InstanceExists(String),

    /// An advisory lock is held by someone else.
    #[error("Device '{device_id}' is locked by '{holder}'")]
    Locked {
        /// Locked device.
        device_id: String,
        /// Current lock holder.
        holder: String,
    },

    /// Invalid runtime configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error on a socket or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KaraboError {
    /// Failure text and details as carried by an error reply.
    pub fn to_reply(&self) -> (String, String) {
        match self {
            KaraboError::Remote { message, details } => (message.clone(), details.clone()),
            other => (other.to_string(), format!("{other:?}")),
        }
    }

    /// Rebuild an error received as `(message, details)`.
    pub fn remote(message: impl Into<String>, details: impl Into<String>) -> Self {
        KaraboError::Remote {
            message: message.into(),
            details: details.into(),
        }
    }

    /// True for errors that stay local to the slot or request that raised them.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            KaraboError::BrokerUnavailable(_) | KaraboError::Config(_) | KaraboError::Io(_)
        )
    }

    /// True if the error is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, KaraboError::RequestTimeout { .. })
    }
}

impl From<figment::Error> for KaraboError {
    fn from(err: figment::Error) -> Self {
        KaraboError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_exists_message() {
        let err = KaraboError::InstanceExists("d1".into());
        assert_eq!(err.to_string(), "d1 already instantiated and alive");
    }

    #[test]
    fn remote_round_trip() {
        let err = KaraboError::remote("boom", "trace");
        assert_eq!(err.to_reply(), ("boom".to_string(), "trace".to_string()));
        let local = KaraboError::Validation("bad".into());
        assert_eq!(local.to_reply().0, "bad");
    }

    #[test]
    fn core_errors_convert() {
        fn lookup() -> KaraboResult<i32> {
            Ok(karabo_core::Hash::new().get::<i32>("x")?)
        }
        assert!(matches!(lookup(), Err(KaraboError::Core(CoreError::PathNotFound { .. }))));
    }

    #[test]
    fn recoverability() {
        assert!(KaraboError::Cancelled("x".into()).is_recoverable());
        assert!(!KaraboError::BrokerUnavailable("gone".into()).is_recoverable());
        let timeout = KaraboError::RequestTimeout {
            target: "a".into(),
            slot: "b".into(),
            timeout_ms: 1,
        };
        assert!(timeout.is_timeout());
    }
}
