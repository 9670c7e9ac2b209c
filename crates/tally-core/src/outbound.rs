//! The seam between a session and whatever carries bytes to a participant.

use std::sync::Arc;

use tokio::sync::mpsc;

/// One encoded outbound envelope, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Why a frame could not be handed to a participant's connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("send queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Outbound path to a single participant.
///
/// `deliver` is called while the owning session's write lock is held, so it
/// must never block: queue the frame or fail immediately.
pub trait Outbound: Send + Sync {
    fn deliver(&self, frame: Frame) -> Result<(), DeliveryError>;
}

/// A bounded queue drained by a per-connection writer task.
impl Outbound for mpsc::Sender<Frame> {
    fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}
