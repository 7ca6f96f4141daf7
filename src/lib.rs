//! # Squall
//!
//! Squall is the composition core of a hardware composer. Every frame a
//! display server hands it one list of layers per display, and squall
//! decides which of those layers can be scanned out directly by the
//! display hardware's planes and which must be rendered by the GPU into
//! the framebuffer target.
//!
//! The pieces, from the bottom up:
//! * `buffer` - a refcounted cache of hardware buffer mappings and the
//!   frame buffer pool.
//! * `plane` - the plane inventory and the allocator handing it out.
//! * `compositor` - capability checks and the layer to plane search.
//! * `vsync` - hardware and software vsync threads.
//! * `hotplug` - the uevent listener and the pending event queue.
//! * `display` - the per display state machine.
//! * `hwc` - the context object owning all of the above.
//!
//! ## Frame protocol
//!
//! The display server drives squall from a single thread:
//! * `Hwcomposer::prepare` with one `DisplayContents` per display. Every
//!   layer comes back with an `Assignment` saying whether it was given a
//!   plane or must be drawn by the GPU.
//! * The server renders all `Framebuffer` layers into the framebuffer
//!   target, the last layer of each list.
//! * `Hwcomposer::commit` with the same lists flips the planes and
//!   attaches release and retire fences.
//!
//! ```no_run
//! use squall as sq;
//! use std::sync::Arc;
//!
//! struct Procs;
//! impl sq::HwcProcs for Procs {
//!     fn on_vsync(&self, _display: usize, _timestamp: i64) {}
//!     fn on_hotplug(&self, _display: usize, _connected: bool) {}
//! }
//!
//! let backend = Arc::new(sq::HeadlessBackend::new(1));
//! let config = sq::HwcConfig::default();
//! let mut hwc =
//!     sq::Hwcomposer::initialize(config, backend.clone(), backend.clone(), Arc::new(Procs))
//!         .unwrap();
//!
//! let buf = backend.import_buffer(
//!     sq::PixelFormat::Rgba8888,
//!     1920,
//!     1080,
//!     sq::BufferUsage::HW_COMPOSER,
//! );
//! let target = backend.import_buffer(
//!     sq::PixelFormat::Rgba8888,
//!     1920,
//!     1080,
//!     sq::BufferUsage::HW_FB,
//! );
//! let mut displays = vec![Some(sq::DisplayContents::new(vec![
//!     sq::Layer::from_buffer(&buf),
//!     sq::Layer::framebuffer_target(&target),
//! ]))];
//!
//! hwc.prepare(&mut displays).unwrap();
//! hwc.commit(&mut displays).unwrap();
//! ```
#[macro_use]
extern crate bitflags;

mod backend;
mod buffer;
mod compositor;
mod config;
mod display;
mod hotplug;
mod hwc;
mod layer;
mod plane;
mod sync;
mod vsync;

pub use backend::headless::HeadlessBackend;
pub use backend::{
    BufferBackend, DetectedDisplay, DisplayBackend, FlipRequest, MappedRegion, ModeInfo, PlaneFlip,
};
pub use buffer::cache::{BufferCache, BufferMapping};
pub use buffer::{BufferManager, DataBuffer, DataBufferGuard};
pub use compositor::capabilities::{PlaneCapabilities, Rejection};
pub use compositor::{
    priority_score, AssignResult, LayerCompositor, PRIORITY_OVERLAY, PRIORITY_PROTECTED,
};
pub use config::{CapabilityLimits, DeviceKind, HwcConfig, PlaneInventory, VsyncSettings};
pub use display::{DisplayAttribute, DisplayConfig, DisplayDevice, DisplayState, PowerMode};
pub use hotplug::{parse_uevent, HotplugEventQueue, HotplugKind, PendingEvent, Uevent};
pub use hwc::{HwcProcs, Hwcomposer};
pub use layer::{
    Assignment, Blending, BufferHandle, BufferUsage, CompositionHint, CompositionType,
    ContentsFlags, DisplayContents, Layer, LayerFlags, PixelFormat, Transform,
};
pub use plane::manager::{PlaneAllocator, ZOrderConfig, ZOrderLayer};
pub use plane::{DisplayPlane, PlaneRef, PlaneType};
pub use sync::{Fence, SyncTimeline};
pub use vsync::{next_deadline, VsyncObserver, VsyncSource};

pub use utils::region::Rect;

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Errors reported by the composition core
///
/// Capability rejections and plane exhaustion are not errors, they
/// only move layers onto the GPU path. These cover the calls that can
/// actually fail.
#[derive(Error, Debug, Eq, PartialEq, Copy, Clone)]
#[allow(non_camel_case_types)]
pub enum HwcError {
    #[error("No display exists at this index")]
    INVALID_DISPLAY,
    #[error("The requested display config does not exist")]
    INVALID_CONFIG,
    #[error("Buffer handle is null or unknown to the buffer backend")]
    INVALID_HANDLE,
    #[error("The display is not connected")]
    NOT_CONNECTED,
    #[error("The composer has not been initialized")]
    NOT_INITIALIZED,
    #[error("Could not map buffer into display memory")]
    MAP_FAILED,
    #[error("Could not allocate buffer")]
    ALLOC_FAILED,
    #[error("The display hardware rejected the request")]
    HARDWARE_FAILURE,
    #[error("Could not communicate with a worker thread")]
    THREAD_FAILURE,
}

pub type Result<T> = std::result::Result<T, HwcError>;
