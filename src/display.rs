// Per display state machine
//
// A display is either disconnected or connected in some power mode.
// It owns the compositor for its layer lists, its vsync thread, its
// pinned primary plane and the timeline its fences live on.
use crate::backend::{DetectedDisplay, DisplayBackend, FlipRequest, ModeInfo};
use crate::buffer::BufferManager;
use crate::compositor::{AssignResult, LayerCompositor};
use crate::config::{CapabilityLimits, DeviceKind, VsyncSettings};
use crate::hwc::HwcProcs;
use crate::layer::DisplayContents;
use crate::plane::manager::PlaneAllocator;
use crate::plane::{PlaneRef, PlaneType};
use crate::sync::SyncTimeline;
use crate::vsync::{VsyncObserver, VsyncSource};
use crate::{HwcError, Result};
use utils::log;

use std::fmt::Write;
use std::sync::Arc;

/// DPI reported when the panel does not know its physical size
pub const DEFAULT_DPI: u32 = 160;
const INCHES_PER_MM: f32 = 0.03937;
/// Nominal mode of displays with no hardware behind them
const DUMMY_WIDTH: u32 = 1920;
const DUMMY_HEIGHT: u32 = 1080;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    On,
    /// Blanked
    Off,
    /// Low power but still scanning out
    Standby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Disconnected,
    Connected(PowerMode),
}

impl DisplayState {
    pub fn is_connected(self) -> bool {
        self != DisplayState::Disconnected
    }

    /// Are frames shown in this state
    pub fn is_scanning(self) -> bool {
        matches!(
            self,
            DisplayState::Connected(PowerMode::On) | DisplayState::Connected(PowerMode::Standby)
        )
    }
}

/// One mode a display can be switched to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    pub cf_refresh: u32,
    pub cf_width: u32,
    pub cf_height: u32,
    pub cf_dpi_x: u32,
    pub cf_dpi_y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayAttribute {
    /// Nanoseconds between vsyncs
    VsyncPeriod,
    Width,
    Height,
    /// Dots per thousand inches
    DpiX,
    DpiY,
}

impl DisplayConfig {
    fn from_mode(mode: &ModeInfo, dpi: (u32, u32)) -> Self {
        Self {
            cf_refresh: mode.mi_refresh,
            cf_width: mode.mi_width,
            cf_height: mode.mi_height,
            cf_dpi_x: dpi.0,
            cf_dpi_y: dpi.1,
        }
    }

    pub fn vsync_period(&self) -> i64 {
        match self.cf_refresh {
            0 => 0,
            r => 1_000_000_000 / r as i64,
        }
    }

    pub fn attribute(&self, attr: DisplayAttribute) -> i32 {
        match attr {
            DisplayAttribute::VsyncPeriod => self.vsync_period() as i32,
            DisplayAttribute::Width => self.cf_width as i32,
            DisplayAttribute::Height => self.cf_height as i32,
            DisplayAttribute::DpiX => (self.cf_dpi_x * 1000) as i32,
            DisplayAttribute::DpiY => (self.cf_dpi_y * 1000) as i32,
        }
    }
}

fn dpi(pixels: u32, mm: u32) -> u32 {
    match mm {
        0 => DEFAULT_DPI,
        mm => (pixels as f32 / (mm as f32 * INCHES_PER_MM)) as u32,
    }
}

/// Build the config list for what was detected on a display
///
/// The preferred mode comes first, followed by the other refresh rates
/// available at the same resolution. Each entry is paired with the mode
/// that programs it.
fn build_configs(detected: &DetectedDisplay) -> Vec<(DisplayConfig, ModeInfo)> {
    let preferred = match detected
        .dt_modes
        .iter()
        .find(|m| m.mi_preferred)
        .or_else(|| detected.dt_modes.first())
    {
        Some(m) => *m,
        None => return Vec::new(),
    };

    let (mm_w, mm_h) = detected.dt_physical_mm;
    let dpi = (dpi(preferred.mi_width, mm_w), dpi(preferred.mi_height, mm_h));

    let mut ret = vec![(DisplayConfig::from_mode(&preferred, dpi), preferred)];
    for mode in detected.dt_modes.iter() {
        if mode.mi_width != preferred.mi_width || mode.mi_height != preferred.mi_height {
            continue;
        }
        if ret.iter().any(|(c, _)| c.cf_refresh == mode.mi_refresh) {
            continue;
        }
        ret.push((DisplayConfig::from_mode(mode, dpi), *mode));
    }
    ret
}

/// One display
///
/// The client thread drives this through `prepare` and `commit` every
/// frame. Hotplug events and power requests move it between states,
/// and nothing here ever fails a frame: a display that can not show
/// the frame just draws it on the GPU or skips the flip.
pub struct DisplayDevice {
    dd_index: usize,
    dd_kind: DeviceKind,
    dd_state: DisplayState,
    dd_backend: Arc<dyn DisplayBackend>,
    dd_configs: Vec<DisplayConfig>,
    /// The mode behind each entry of dd_configs
    dd_modes: Vec<ModeInfo>,
    dd_active_config: usize,
    dd_compositor: LayerCompositor,
    /// Our primary plane, pinned while connected
    dd_primary: Option<PlaneRef>,
    dd_vsync: Option<VsyncObserver>,
    dd_last_vsync: Option<i64>,
    /// Release and retire fences of committed frames
    dd_timeline: SyncTimeline,
    /// Draw the next frame entirely on the GPU
    dd_redraw_pending: bool,
    /// prepare ran and commit may flip
    dd_prepared: bool,
    dd_frames: u64,
}

impl DisplayDevice {
    pub fn new(
        index: usize,
        kind: DeviceKind,
        backend: Arc<dyn DisplayBackend>,
        limits: CapabilityLimits,
    ) -> Self {
        Self {
            dd_index: index,
            dd_kind: kind,
            dd_state: DisplayState::Disconnected,
            dd_backend: backend,
            dd_configs: Vec::new(),
            dd_modes: Vec::new(),
            dd_active_config: 0,
            dd_compositor: LayerCompositor::new(index, limits),
            dd_primary: None,
            dd_vsync: None,
            dd_last_vsync: None,
            dd_timeline: SyncTimeline::new(),
            dd_redraw_pending: false,
            dd_prepared: false,
            dd_frames: 0,
        }
    }

    /// Detect what is attached and start the vsync thread
    ///
    /// Fails if the display hardware could not be queried.
    pub fn initialize(
        &mut self,
        planes: &mut PlaneAllocator,
        vsync: &VsyncSettings,
        procs: Arc<dyn HwcProcs>,
    ) -> Result<()> {
        let mut source = None;

        match self.dd_kind {
            DeviceKind::Dummy => {
                let config = DisplayConfig {
                    cf_refresh: vsync.default_refresh,
                    cf_width: DUMMY_WIDTH,
                    cf_height: DUMMY_HEIGHT,
                    cf_dpi_x: DEFAULT_DPI,
                    cf_dpi_y: DEFAULT_DPI,
                };
                self.dd_configs = vec![config];
                self.dd_modes = vec![ModeInfo {
                    mi_width: DUMMY_WIDTH,
                    mi_height: DUMMY_HEIGHT,
                    mi_refresh: vsync.default_refresh,
                    mi_preferred: true,
                }];
                self.dd_state = DisplayState::Connected(PowerMode::On);
            }
            DeviceKind::Primary | DeviceKind::External => {
                let detected = self.dd_backend.detect(self.dd_index).map_err(|e| {
                    log::error!("Could not detect display {}: {}", self.dd_index, e);
                    e
                })?;
                self.update_configs(detected);
                if self.dd_kind == DeviceKind::Primary && !self.dd_state.is_connected() {
                    log::warn!("Primary display {} has nothing attached", self.dd_index);
                }
                self.pin_primary(planes);

                if !vsync.force_software {
                    source = self.dd_backend.vsync_fd(self.dd_index).map(VsyncSource::Hardware);
                }
            }
        }

        let period = self
            .active_display_config()
            .map(|c| c.vsync_period())
            .filter(|p| *p > 0)
            .unwrap_or(1_000_000_000 / vsync.default_refresh.max(1) as i64);
        let source = source.unwrap_or(VsyncSource::Software { period_ns: period });
        self.dd_vsync = Some(VsyncObserver::new(
            self.dd_index,
            source,
            self.dd_backend.clone(),
            procs,
        )?);

        log::info!(
            "Display {} ({}): {:?}, {} configs",
            self.dd_index,
            self.name(),
            self.dd_state,
            self.dd_configs.len()
        );
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.dd_index
    }

    pub fn kind(&self) -> DeviceKind {
        self.dd_kind
    }

    pub fn name(&self) -> &'static str {
        match self.dd_kind {
            DeviceKind::Primary => "primary",
            DeviceKind::External => "external",
            DeviceKind::Dummy => "dummy",
        }
    }

    pub fn state(&self) -> DisplayState {
        self.dd_state
    }

    pub fn is_connected(&self) -> bool {
        self.dd_state.is_connected()
    }

    pub fn primary_plane(&self) -> Option<PlaneRef> {
        self.dd_primary
    }

    /// The newest vsync timestamp seen at a prepare
    pub fn last_vsync(&self) -> Option<i64> {
        self.dd_last_vsync
    }

    pub fn frames(&self) -> u64 {
        self.dd_frames
    }

    pub fn compositor(&self) -> &LayerCompositor {
        &self.dd_compositor
    }

    fn active_display_config(&self) -> Option<&DisplayConfig> {
        self.dd_configs.get(self.dd_active_config)
    }

    fn uses_planes(&self) -> bool {
        self.dd_kind != DeviceKind::Dummy
    }

    fn update_configs(&mut self, detected: Option<DetectedDisplay>) {
        let configs = detected.as_ref().map(build_configs).unwrap_or_default();
        self.dd_configs = configs.iter().map(|(c, _)| *c).collect();
        self.dd_modes = configs.iter().map(|(_, m)| *m).collect();
        self.dd_active_config = 0;

        self.dd_state = match (self.dd_configs.is_empty(), self.dd_state) {
            (true, _) => {
                if detected.is_some() {
                    log::error!("Display {} reported no usable modes", self.dd_index);
                }
                DisplayState::Disconnected
            }
            (false, DisplayState::Connected(mode)) => DisplayState::Connected(mode),
            (false, DisplayState::Disconnected) => DisplayState::Connected(PowerMode::On),
        };
    }

    fn pin_primary(&mut self, planes: &mut PlaneAllocator) {
        if self.dd_primary.is_some() || !self.uses_planes() || !self.is_connected() {
            return;
        }
        self.dd_primary = planes.acquire_for(self.dd_index, PlaneType::Primary);
        if self.dd_primary.is_none() {
            log::debug!("Display {}: primary plane not available yet", self.dd_index);
        }
    }

    fn sync_vsync_period(&mut self) {
        let period = self.active_display_config().map(|c| c.vsync_period());
        if let (Some(vsync), Some(p)) = (self.dd_vsync.as_mut(), period) {
            vsync.set_period(p);
        }
    }

    /// Apply a connection change picked up by the uevent thread
    pub fn on_hotplug(
        &mut self,
        connected: bool,
        planes: &mut PlaneAllocator,
        bm: &BufferManager,
    ) {
        if self.dd_kind == DeviceKind::Dummy {
            return;
        }

        match connected {
            true => {
                let detected = match self.dd_backend.detect(self.dd_index) {
                    Ok(d) => d,
                    Err(e) => {
                        log::error!("Display {}: detection failed: {}", self.dd_index, e);
                        return;
                    }
                };
                let was_connected = self.is_connected();
                self.update_configs(detected);
                if !self.is_connected() {
                    return;
                }
                if !was_connected {
                    log::info!("Display {} connected", self.dd_index);
                }
                self.pin_primary(planes);
                self.sync_vsync_period();
                self.dd_redraw_pending = true;
            }
            false => {
                if !self.is_connected() {
                    return;
                }
                log::info!("Display {} disconnected", self.dd_index);
                self.dd_state = DisplayState::Disconnected;
                self.dd_configs.clear();
                self.dd_modes.clear();
                self.dd_active_config = 0;
                self.release_planes(planes, bm);
                self.dd_timeline.signal_all();
            }
        }
        self.dd_prepared = false;
    }

    /// Give back every plane including the pinned primary
    fn release_planes(&mut self, planes: &mut PlaneAllocator, bm: &BufferManager) {
        self.dd_compositor.release_planes(planes, bm);
        planes.reclaim(self.dd_index, bm);
        self.dd_primary = None;
    }

    /// Decide the composition of this display's next frame
    pub fn prepare(
        &mut self,
        contents: Option<&mut DisplayContents>,
        planes: &mut PlaneAllocator,
        bm: &BufferManager,
    ) -> Result<()> {
        if let Some(ts) = self.dd_vsync.as_ref().and_then(|v| v.last_vsync()) {
            self.dd_last_vsync = Some(ts);
        }
        self.dd_prepared = false;

        let contents = match contents {
            Some(c) => c,
            None => {
                self.dd_compositor.release_planes(planes, bm);
                return Ok(());
            }
        };

        if !self.dd_state.is_scanning() || !self.uses_planes() {
            log::trace!("Display {}: {:?}, all layers on the GPU", self.dd_index, self.dd_state);
            self.dd_compositor.release_planes(planes, bm);
            contents.force_gpu();
            return Ok(());
        }

        self.pin_primary(planes);

        if self.dd_redraw_pending {
            log::debug!("Display {}: redrawing on the GPU after hotplug", self.dd_index);
            self.dd_compositor.compose_on_gpu(
                &mut contents.dc_layers,
                planes,
                bm,
                self.dd_primary,
            );
            self.dd_redraw_pending = false;
        } else {
            let primary = self.dd_primary;
            if self.dd_compositor.prepare(contents, planes, bm, primary) == AssignResult::Fallback {
                log::debug!("Display {}: frame composed on the GPU", self.dd_index);
            }
        }

        self.dd_prepared = true;
        Ok(())
    }

    /// Flip the frame decided by the last prepare
    ///
    /// Fences of the previous frame are signaled and new ones are
    /// attached to the layers that are scanned out and to the frame.
    pub fn commit(
        &mut self,
        contents: Option<&mut DisplayContents>,
        planes: &mut PlaneAllocator,
        bm: &BufferManager,
    ) -> Result<()> {
        let contents = match contents {
            Some(c) if self.dd_prepared && self.dd_state.is_scanning() => c,
            _ => {
                log::trace!("Display {}: nothing to commit", self.dd_index);
                return Ok(());
            }
        };
        self.dd_prepared = false;

        if contents.dc_layers.len() != self.dd_compositor.layer_count() {
            log::warn!(
                "Display {}: layer list changed between prepare and commit",
                self.dd_index
            );
            return Ok(());
        }

        if let Err(e) = self.dd_compositor.bind_target(&contents.dc_layers, planes, bm) {
            log::error!("Display {}: could not bind framebuffer target: {}", self.dd_index, e);
        }

        let active = self.dd_compositor.active_zorder();
        let active_planes = active.planes();
        let request = FlipRequest {
            fr_planes: active_planes
                .iter()
                .filter_map(|p| planes.plane(*p).and_then(|plane| plane.flip_state()))
                .collect(),
            fr_disabled: planes.pending_disables(self.dd_index, &active_planes),
        };

        let flipped = match self.dd_backend.flip(self.dd_index, &request) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Display {}: flip failed: {}", self.dd_index, e);
                false
            }
        };

        if flipped {
            for p in active_planes.iter() {
                if let Some(plane) = planes.plane_mut(*p) {
                    plane.post_flip(bm);
                }
            }
            self.dd_frames += 1;
        }

        // the frame before this one is off the screen now
        self.dd_timeline.signal_all();
        let fence = self.dd_timeline.create_fence();
        if !flipped {
            self.dd_timeline.signal_all();
        }
        for layer in contents.dc_layers.iter_mut() {
            layer.l_release_fence = match layer.l_assignment.a_plane.is_some() {
                true => Some(fence.clone()),
                false => None,
            };
        }
        contents.dc_retire_fence = Some(fence);

        Ok(())
    }

    pub fn vsync_control(&mut self, enabled: bool) -> bool {
        match self.dd_vsync.as_mut() {
            Some(v) => v.control(enabled),
            None => false,
        }
    }

    pub fn set_power_mode(&mut self, mode: PowerMode) -> Result<()> {
        let current = match self.dd_state {
            DisplayState::Disconnected => return Err(HwcError::NOT_CONNECTED),
            DisplayState::Connected(m) => m,
        };
        if current == mode {
            return Ok(());
        }

        if self.dd_kind != DeviceKind::Dummy {
            self.dd_backend.blank(self.dd_index, mode == PowerMode::Off)?;
        }
        log::debug!("Display {}: {:?} -> {:?}", self.dd_index, current, mode);
        self.dd_state = DisplayState::Connected(mode);
        Ok(())
    }

    pub fn blank(&mut self, blank: bool) -> Result<()> {
        self.set_power_mode(match blank {
            true => PowerMode::Off,
            false => PowerMode::On,
        })
    }

    /// Config ids, the active one first after a detection
    pub fn get_display_configs(&self) -> Result<Vec<usize>> {
        if !self.is_connected() {
            return Err(HwcError::NOT_CONNECTED);
        }
        Ok((0..self.dd_configs.len()).collect())
    }

    pub fn get_display_config(&self, config: usize) -> Result<DisplayConfig> {
        if !self.is_connected() {
            return Err(HwcError::NOT_CONNECTED);
        }
        self.dd_configs
            .get(config)
            .copied()
            .ok_or(HwcError::INVALID_CONFIG)
    }

    pub fn get_display_attributes(
        &self,
        config: usize,
        attributes: &[DisplayAttribute],
    ) -> Result<Vec<i32>> {
        let config = self.get_display_config(config)?;
        Ok(attributes.iter().map(|a| config.attribute(*a)).collect())
    }

    pub fn get_active_config(&self) -> Result<usize> {
        if !self.is_connected() {
            return Err(HwcError::NOT_CONNECTED);
        }
        Ok(self.dd_active_config)
    }

    pub fn set_active_config(&mut self, config: usize) -> Result<()> {
        self.get_display_config(config)?;
        if config == self.dd_active_config {
            return Ok(());
        }

        match self.dd_kind {
            // fixed panel timings
            DeviceKind::Primary | DeviceKind::Dummy => Err(HwcError::INVALID_CONFIG),
            DeviceKind::External => {
                let mode = self.dd_modes[config];
                self.dd_backend.set_mode(self.dd_index, &mode).map_err(|e| {
                    log::error!("Display {}: could not set mode: {}", self.dd_index, e);
                    e
                })?;
                log::info!(
                    "Display {}: switched to {}x{}@{}",
                    self.dd_index,
                    mode.mi_width,
                    mode.mi_height,
                    mode.mi_refresh
                );
                self.dd_active_config = config;
                self.sync_vsync_period();
                self.dd_redraw_pending = true;
                Ok(())
            }
        }
    }

    pub fn dump(&self, d: &mut String) {
        let _ = writeln!(
            d,
            "Display {} ({}): {:?}, {} frames",
            self.dd_index,
            self.name(),
            self.dd_state,
            self.dd_frames
        );
        if let Some(c) = self.active_display_config() {
            let _ = writeln!(
                d,
                "  mode {}x{}@{} dpi {}x{} (config {} of {})",
                c.cf_width,
                c.cf_height,
                c.cf_refresh,
                c.cf_dpi_x,
                c.cf_dpi_y,
                self.dd_active_config,
                self.dd_configs.len()
            );
        }
        if let Some(v) = self.dd_vsync.as_ref() {
            let _ = writeln!(
                d,
                "  vsync: {} {}",
                match v.is_hardware() {
                    true => "hardware",
                    false => "software",
                },
                match v.is_enabled() {
                    true => "on",
                    false => "off",
                }
            );
        }
        if self.dd_state.is_scanning() && self.uses_planes() {
            self.dd_compositor.dump(d);
        }
    }

    /// Stop the vsync thread and give back every plane
    pub fn deinitialize(&mut self, planes: &mut PlaneAllocator, bm: &BufferManager) {
        if let Some(mut vsync) = self.dd_vsync.take() {
            vsync.deinitialize();
        }
        if self.uses_planes() {
            self.release_planes(planes, bm);
        }
        self.dd_timeline.signal_all();
        self.dd_prepared = false;
    }
}
