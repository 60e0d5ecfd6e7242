//! Services - bridging logic and shared state
//!
//! This module contains the core services:
//! - `presence` - Threshold-gated presence lifecycle (appeared / lost)
//! - `frame_buffer` - Latest-frame broadcast slot for video viewers
//! - `hub` - Event fan-out to live subscribers
//! - `serial_bridge` - Serial source loop (read, decode, publish)
//! - `vision_worker` - Camera loop (capture, classify, track)

pub mod frame_buffer;
pub mod hub;
pub mod presence;
pub mod serial_bridge;
pub mod vision_worker;

// Re-export commonly used types
pub use frame_buffer::{Frame, FrameBroadcastBuffer, FrameReader};
pub use hub::{EventDispatchHub, HubMessage, SubscriberId, Subscription};
pub use presence::PresenceTracker;
pub use serial_bridge::SerialBridge;
pub use vision_worker::{VisionSettings, VisionWorker};
