use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::debug;

use crate::Frame;

/// Observer for finished frames and engine status text.
///
/// Called synchronously on the acquisition path, so implementations must
/// return quickly; queue the work and hand it off instead of blocking.
pub trait FrameSink: Send {
    fn deliver(&self, frame: &Frame);

    fn status(&self, _message: &str) {}
}

/// Non-blocking sink that forwards frames over bounded channels.
///
/// Frames are dropped when the receiver falls behind rather than stalling
/// the hardware callback.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    frames: Sender<Frame>,
    status: Option<Sender<String>>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<Frame>) {
        let (frames, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                frames,
                status: None,
            },
            rx,
        )
    }

    /// Also forwards status messages, returning their receiver.
    pub fn with_status(mut self, capacity: usize) -> (Self, Receiver<String>) {
        let (status, rx) = crossbeam_channel::bounded(capacity);
        self.status = Some(status);
        (self, rx)
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&self, frame: &Frame) {
        match self.frames.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                debug!(index = frame.index, "frame receiver is behind; dropping frame");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn status(&self, message: &str) {
        if let Some(status) = &self.status {
            let _ = status.try_send(message.to_string());
        }
    }
}

/// Adapts a closure into a [`FrameSink`].
pub struct CallbackSink<F>(pub F);

impl<F> FrameSink for CallbackSink<F>
where
    F: Fn(&Frame) + Send,
{
    fn deliver(&self, frame: &Frame) {
        (self.0)(frame)
    }
}
