//! Frame source abstraction.

use siteguard_core::Frame;

/// A device producing a sequence of frames.
///
/// The producer loop owns its source exclusively. `close` must be
/// idempotent; `next_frame` after `close` returns `None`.
pub trait FrameSource: Send {
    /// Block until the next frame is available. `None` marks end of stream:
    /// the source was closed, the device failed, or no frame arrived
    /// within the device-level timeout.
    fn next_frame(&mut self) -> Option<Frame>;

    /// Release the device.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Option<Frame> {
        (**self).next_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
