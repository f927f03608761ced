//! Delivery callbacks
//!
//! A [`Deliver`] implementation hands one message to its recipient. The
//! queue processor and the router call it for every dispatch; an `Err` is a
//! failed attempt and is retried according to the caller's policy.
//!
//! Plain closures implement the trait:
//!
//! ```
//! use mailq_core::delivery::{Deliver, DeliveryError};
//! use mailq_core::schema::Message;
//!
//! let reject_all = |_msg: &Message| -> Result<(), DeliveryError> {
//!     Err(DeliveryError::Rejected("offline".into()))
//! };
//! let _: &dyn Deliver = &reject_all;
//! ```

pub mod inbox;

use crate::schema::Message;
use std::path::PathBuf;
use thiserror::Error;

pub use inbox::{InboxDelivery, InboxItem, read_inbox};

/// Delivery failure
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The recipient refused or could not accept the message
    #[error("delivery rejected: {0}")]
    Rejected(String),

    /// Writing the delivery artifact failed
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The delivery function panicked
    #[error("delivery panicked: {0}")]
    Panicked(String),
}

impl DeliveryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a `Panicked` error from a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let text = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::Panicked(text)
    }
}

/// Hands a message to its recipient
pub trait Deliver: Send + Sync {
    fn deliver(&self, message: &Message) -> Result<(), DeliveryError>;
}

impl<F> Deliver for F
where
    F: Fn(&Message) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        self(message)
    }
}

/// Call `deliver`, converting a panic into `DeliveryError::Panicked`
pub(crate) fn deliver_catching(
    deliver: &dyn Deliver,
    message: &Message,
) -> Result<(), DeliveryError> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| deliver.deliver(message)))
        .unwrap_or_else(|payload| Err(DeliveryError::from_panic(payload)))
}
