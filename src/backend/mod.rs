// Interfaces to the display and buffer hardware
//
// The composition core never talks to a kernel driver itself. Display
// engines and buffer allocators plug in underneath these traits.
pub mod headless;

use crate::buffer::DataBuffer;
use crate::layer::{BufferHandle, BufferUsage, PixelFormat, Transform};
use crate::plane::PlaneRef;
use crate::Result;
use utils::region::Rect;

use std::os::fd::OwnedFd;

/// A display timing the hardware can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub mi_width: u32,
    pub mi_height: u32,
    pub mi_refresh: u32,
    /// The panel's native mode
    pub mi_preferred: bool,
}

/// What was found on a display pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedDisplay {
    pub dt_modes: Vec<ModeInfo>,
    /// Physical size in millimeters, zero when unknown
    pub dt_physical_mm: (u32, u32),
}

/// Device addresses of one mapped buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MappedRegion {
    /// Offset in the display engine's address space
    pub mr_gtt_offset: u64,
    /// Where the CPU can reach it, zero if not CPU mapped
    pub mr_cpu_addr: u64,
    pub mr_size: u64,
}

/// Scanout state of one plane for a flip
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneFlip {
    pub pf_plane: PlaneRef,
    /// Stacking position, 0 is the bottom
    pub pf_zorder: usize,
    pub pf_handle: BufferHandle,
    pub pf_offset: u64,
    pub pf_position: Rect<i32>,
    pub pf_crop: Rect<f32>,
    pub pf_transform: Transform,
    pub pf_alpha: u8,
}

/// Everything that changes on one display in one flip
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlipRequest {
    pub fr_planes: Vec<PlaneFlip>,
    /// Planes to turn off with this flip
    pub fr_disabled: Vec<PlaneRef>,
}

/// The display engine
///
/// Displays are addressed by their index in the composer's display
/// list. Calls may come from the client thread or, for `detect`, from
/// the uevent thread.
pub trait DisplayBackend: Send + Sync {
    /// Query what is attached to a display, None if nothing is
    fn detect(&self, display: usize) -> Result<Option<DetectedDisplay>>;

    fn set_mode(&self, display: usize, mode: &ModeInfo) -> Result<()>;

    fn blank(&self, display: usize, blank: bool) -> Result<()>;

    /// Turn hardware vsync interrupts on or off
    fn vsync_control(&self, display: usize, enabled: bool) -> Result<()>;

    /// An fd that becomes readable on every hardware vsync
    ///
    /// None if this display has no hardware vsync source, in which
    /// case vsync is generated in software.
    fn vsync_fd(&self, display: usize) -> Option<OwnedFd>;

    /// The kernel uevent socket hotplug notifications arrive on
    fn uevent_fd(&self) -> Option<OwnedFd>;

    /// Queue a page flip on a display
    fn flip(&self, display: usize, request: &FlipRequest) -> Result<()>;
}

/// The buffer allocator and its display memory mapper
pub trait BufferBackend: Send + Sync {
    /// Look up the metadata of a buffer
    fn describe(&self, handle: BufferHandle) -> Result<DataBuffer>;

    /// Map a buffer into display memory
    fn map(&self, buffer: &DataBuffer) -> Result<MappedRegion>;

    fn unmap(&self, buffer: &DataBuffer, region: &MappedRegion);

    /// Allocate a buffer, returning its handle and stride in bytes
    fn alloc(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<(BufferHandle, u32)>;

    fn free(&self, handle: BufferHandle);

    /// Register a mapped buffer as a kernel framebuffer
    fn fb_handle(&self, buffer: &DataBuffer) -> Result<u32>;

    fn release_fb_handle(&self, fb: u32);
}
