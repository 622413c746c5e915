//! rollcall-hw — Camera capture and the frame acquisition loop.
//!
//! Provides V4L2-based camera access and `FrameSource`, which pulls frames on
//! a dedicated thread and hands the newest one to consumers.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, V4lProvider};
pub use frame::Frame;
pub use source::{
    CaptureDevice, DeviceProvider, FrameSource, SourceSettings, SourceStatus, SubscriptionId,
};
