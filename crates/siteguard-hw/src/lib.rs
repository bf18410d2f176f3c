//! siteguard-hw — Camera capture for the SiteGuard pipeline.
//!
//! Provides the `FrameSource` abstraction and a V4L2 implementation that
//! converts YUYV, MJPG and RGB3 buffers to RGB frames.

pub mod camera;
pub mod convert;
pub mod source;

pub use camera::{Camera, CameraError, CaptureSettings, DeviceInfo, PixelFormat};
pub use source::FrameSource;
