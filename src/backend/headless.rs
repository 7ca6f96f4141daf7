/// Headless display and buffer backend
///
/// Keeps all hardware state in memory. This is what the demo binary and
/// the tests run on: it records every flip and map call, lets the caller
/// plug displays in and out, and can be told to fail specific requests.
use super::{
    BufferBackend, DetectedDisplay, DisplayBackend, FlipRequest, MappedRegion, ModeInfo,
};
use crate::buffer::DataBuffer;
use crate::layer::{BufferHandle, BufferUsage, PixelFormat};
use crate::{HwcError, Result};
use utils::log;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixDatagram;

/// Rows are padded to this many bytes
const STRIDE_ALIGNMENT: u32 = 64;
/// Uevent path of the display engine
pub const DRM_UEVENT_PATH: &str = "/devices/pci0000:00/0000:00:02.0/drm/card0";

struct HeadlessState {
    hs_displays: Vec<Option<DetectedDisplay>>,
    hs_modes: Vec<Option<ModeInfo>>,
    hs_blanked: Vec<bool>,
    hs_vsync_enabled: Vec<bool>,
    hs_flips: Vec<Vec<FlipRequest>>,
    hs_fail_detect: HashSet<usize>,
    hs_fail_flip: bool,
    hs_hw_vsync: bool,
    hs_buffers: HashMap<BufferHandle, DataBuffer>,
    hs_next_handle: BufferHandle,
    hs_next_offset: u64,
    hs_fail_map: HashSet<BufferHandle>,
    hs_map_calls: HashMap<BufferHandle, usize>,
    hs_unmap_calls: HashMap<BufferHandle, usize>,
    hs_fbs: HashMap<u32, BufferHandle>,
    hs_next_fb: u32,
}

pub struct HeadlessBackend {
    hb_state: Mutex<HeadlessState>,
    /// Our end of the uevent socket
    hb_uevent: Mutex<Option<UnixDatagram>>,
    /// Our ends of the per display vsync sockets
    hb_vsync: Mutex<HashMap<usize, UnixDatagram>>,
}

impl HeadlessBackend {
    /// A backend with `displays` pipes, all with a monitor attached
    pub fn new(displays: usize) -> Self {
        Self {
            hb_state: Mutex::new(HeadlessState {
                hs_displays: vec![Some(Self::default_display()); displays],
                hs_modes: vec![None; displays],
                hs_blanked: vec![false; displays],
                hs_vsync_enabled: vec![false; displays],
                hs_flips: vec![Vec::new(); displays],
                hs_fail_detect: HashSet::new(),
                hs_fail_flip: false,
                hs_hw_vsync: false,
                hs_buffers: HashMap::new(),
                hs_next_handle: 0x1000,
                hs_next_offset: 0x10_0000,
                hs_fail_map: HashSet::new(),
                hs_map_calls: HashMap::new(),
                hs_unmap_calls: HashMap::new(),
                hs_fbs: HashMap::new(),
                hs_next_fb: 1,
            }),
            hb_uevent: Mutex::new(None),
            hb_vsync: Mutex::new(HashMap::new()),
        }
    }

    /// A 1080p monitor that can also run at 50Hz and 720p
    pub fn default_display() -> DetectedDisplay {
        DetectedDisplay {
            dt_modes: vec![
                ModeInfo {
                    mi_width: 1920,
                    mi_height: 1080,
                    mi_refresh: 60,
                    mi_preferred: true,
                },
                ModeInfo {
                    mi_width: 1920,
                    mi_height: 1080,
                    mi_refresh: 50,
                    mi_preferred: false,
                },
                ModeInfo {
                    mi_width: 1280,
                    mi_height: 720,
                    mi_refresh: 60,
                    mi_preferred: false,
                },
            ],
            dt_physical_mm: (527, 296),
        }
    }

    /// Hand out vsync fds so displays use hardware vsync
    pub fn set_hardware_vsync(&self, enabled: bool) {
        self.hb_state.lock().hs_hw_vsync = enabled;
    }

    pub fn connect(&self, display: usize, detected: DetectedDisplay) {
        if let Some(d) = self.hb_state.lock().hs_displays.get_mut(display) {
            *d = Some(detected);
        }
    }

    pub fn disconnect(&self, display: usize) {
        if let Some(d) = self.hb_state.lock().hs_displays.get_mut(display) {
            *d = None;
        }
    }

    pub fn fail_detect(&self, display: usize, fail: bool) {
        let mut state = self.hb_state.lock();
        match fail {
            true => state.hs_fail_detect.insert(display),
            false => state.hs_fail_detect.remove(&display),
        };
    }

    pub fn fail_flip(&self, fail: bool) {
        self.hb_state.lock().hs_fail_flip = fail;
    }

    /// Make the mapper reject this buffer
    pub fn fail_map(&self, handle: BufferHandle, fail: bool) {
        let mut state = self.hb_state.lock();
        match fail {
            true => state.hs_fail_map.insert(handle),
            false => state.hs_fail_map.remove(&handle),
        };
    }

    /// Create a buffer as if a client had allocated it
    pub fn import_buffer(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
        usage: BufferUsage,
    ) -> DataBuffer {
        let mut state = self.hb_state.lock();
        Self::create_buffer(&mut state, width, height, format, usage)
    }

    fn create_buffer(
        state: &mut HeadlessState,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> DataBuffer {
        let stride = (width * format.bytes_per_pixel() + STRIDE_ALIGNMENT - 1)
            / STRIDE_ALIGNMENT
            * STRIDE_ALIGNMENT;
        let handle = state.hs_next_handle;
        state.hs_next_handle += 1;

        let buffer = DataBuffer {
            db_handle: handle,
            db_format: format,
            db_width: width,
            db_height: height,
            db_stride: stride,
            db_usage: usage,
        };
        state.hs_buffers.insert(handle, buffer.clone());
        buffer
    }

    pub fn map_calls(&self, handle: BufferHandle) -> usize {
        *self.hb_state.lock().hs_map_calls.get(&handle).unwrap_or(&0)
    }

    pub fn unmap_calls(&self, handle: BufferHandle) -> usize {
        *self.hb_state.lock().hs_unmap_calls.get(&handle).unwrap_or(&0)
    }

    /// Mappings created and not yet torn down, across all buffers
    pub fn live_mappings(&self) -> usize {
        let state = self.hb_state.lock();
        let maps: usize = state.hs_map_calls.values().sum();
        let unmaps: usize = state.hs_unmap_calls.values().sum();
        maps - unmaps
    }

    pub fn buffer_count(&self) -> usize {
        self.hb_state.lock().hs_buffers.len()
    }

    pub fn flips(&self, display: usize) -> Vec<FlipRequest> {
        self.hb_state
            .lock()
            .hs_flips
            .get(display)
            .cloned()
            .unwrap_or_default()
    }

    pub fn last_flip(&self, display: usize) -> Option<FlipRequest> {
        self.flips(display).pop()
    }

    pub fn is_blanked(&self, display: usize) -> bool {
        *self.hb_state.lock().hs_blanked.get(display).unwrap_or(&false)
    }

    pub fn is_vsync_enabled(&self, display: usize) -> bool {
        *self
            .hb_state
            .lock()
            .hs_vsync_enabled
            .get(display)
            .unwrap_or(&false)
    }

    pub fn active_mode(&self, display: usize) -> Option<ModeInfo> {
        self.hb_state.lock().hs_modes.get(display).cloned().flatten()
    }

    /// Deliver a raw uevent message. Returns false if nobody listens.
    pub fn send_uevent(&self, msg: &[u8]) -> bool {
        match self.hb_uevent.lock().as_ref() {
            Some(sock) => sock.send(msg).is_ok(),
            None => false,
        }
    }

    /// The uevent the display engine emits when a connector changes
    pub fn send_drm_hotplug(&self) -> bool {
        let msg = format!(
            "change@{}\0ACTION=change\0DEVPATH={}\0SUBSYSTEM=drm\0HOTPLUG=1\0",
            DRM_UEVENT_PATH, DRM_UEVENT_PATH
        );
        self.send_uevent(msg.as_bytes())
    }

    /// Fire a hardware vsync with the given timestamp
    pub fn send_vsync(&self, display: usize, timestamp: i64) -> bool {
        match self.hb_vsync.lock().get(&display) {
            Some(sock) => sock.send(format!("VSYNC={}", timestamp).as_bytes()).is_ok(),
            None => false,
        }
    }

    fn check_display(state: &HeadlessState, display: usize) -> Result<()> {
        match display < state.hs_displays.len() {
            true => Ok(()),
            false => Err(HwcError::INVALID_DISPLAY),
        }
    }
}

impl DisplayBackend for HeadlessBackend {
    fn detect(&self, display: usize) -> Result<Option<DetectedDisplay>> {
        let state = self.hb_state.lock();
        Self::check_display(&state, display)?;
        if state.hs_fail_detect.contains(&display) {
            return Err(HwcError::HARDWARE_FAILURE);
        }
        Ok(state.hs_displays[display].clone())
    }

    fn set_mode(&self, display: usize, mode: &ModeInfo) -> Result<()> {
        let mut state = self.hb_state.lock();
        Self::check_display(&state, display)?;
        if state.hs_displays[display].is_none() {
            return Err(HwcError::NOT_CONNECTED);
        }
        state.hs_modes[display] = Some(*mode);
        Ok(())
    }

    fn blank(&self, display: usize, blank: bool) -> Result<()> {
        let mut state = self.hb_state.lock();
        Self::check_display(&state, display)?;
        state.hs_blanked[display] = blank;
        Ok(())
    }

    fn vsync_control(&self, display: usize, enabled: bool) -> Result<()> {
        let mut state = self.hb_state.lock();
        Self::check_display(&state, display)?;
        state.hs_vsync_enabled[display] = enabled;
        Ok(())
    }

    fn vsync_fd(&self, display: usize) -> Option<OwnedFd> {
        if !self.hb_state.lock().hs_hw_vsync {
            return None;
        }

        let (ours, theirs) = UnixDatagram::pair()
            .map_err(|e| log::error!("Could not create vsync socket: {}", e))
            .ok()?;
        self.hb_vsync.lock().insert(display, ours);
        Some(OwnedFd::from(theirs))
    }

    fn uevent_fd(&self) -> Option<OwnedFd> {
        let (ours, theirs) = UnixDatagram::pair()
            .map_err(|e| log::error!("Could not create uevent socket: {}", e))
            .ok()?;
        *self.hb_uevent.lock() = Some(ours);
        Some(OwnedFd::from(theirs))
    }

    fn flip(&self, display: usize, request: &FlipRequest) -> Result<()> {
        let mut state = self.hb_state.lock();
        Self::check_display(&state, display)?;
        if state.hs_fail_flip {
            return Err(HwcError::HARDWARE_FAILURE);
        }
        state.hs_flips[display].push(request.clone());
        Ok(())
    }
}

impl BufferBackend for HeadlessBackend {
    fn describe(&self, handle: BufferHandle) -> Result<DataBuffer> {
        self.hb_state
            .lock()
            .hs_buffers
            .get(&handle)
            .cloned()
            .ok_or(HwcError::INVALID_HANDLE)
    }

    fn map(&self, buffer: &DataBuffer) -> Result<MappedRegion> {
        let mut state = self.hb_state.lock();
        if state.hs_fail_map.contains(&buffer.db_handle) {
            return Err(HwcError::MAP_FAILED);
        }

        let size = buffer.db_stride as u64 * buffer.db_height as u64;
        let region = MappedRegion {
            mr_gtt_offset: state.hs_next_offset,
            mr_cpu_addr: 0,
            mr_size: size,
        };
        state.hs_next_offset += size.max(4096);
        *state.hs_map_calls.entry(buffer.db_handle).or_insert(0) += 1;

        Ok(region)
    }

    fn unmap(&self, buffer: &DataBuffer, _region: &MappedRegion) {
        *self
            .hb_state
            .lock()
            .hs_unmap_calls
            .entry(buffer.db_handle)
            .or_insert(0) += 1;
    }

    fn alloc(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<(BufferHandle, u32)> {
        if width == 0 || height == 0 {
            return Err(HwcError::ALLOC_FAILED);
        }
        let mut state = self.hb_state.lock();
        let buffer = Self::create_buffer(&mut state, width, height, format, usage);
        Ok((buffer.db_handle, buffer.db_stride))
    }

    fn free(&self, handle: BufferHandle) {
        self.hb_state.lock().hs_buffers.remove(&handle);
    }

    fn fb_handle(&self, buffer: &DataBuffer) -> Result<u32> {
        let mut state = self.hb_state.lock();
        let fb = state.hs_next_fb;
        state.hs_next_fb += 1;
        state.hs_fbs.insert(fb, buffer.db_handle);
        Ok(fb)
    }

    fn release_fb_handle(&self, fb: u32) {
        self.hb_state.lock().hs_fbs.remove(&fb);
    }
}
