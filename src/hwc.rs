// The hardware composer context
//
// Owns every piece of composition state. The display server creates one
// with `initialize` and drives it with prepare and commit.
use crate::backend::{BufferBackend, DisplayBackend};
use crate::buffer::BufferManager;
use crate::config::{DeviceKind, HwcConfig};
use crate::display::{DisplayAttribute, DisplayDevice, PowerMode};
use crate::hotplug::{HotplugEventQueue, UeventObserver};
use crate::layer::DisplayContents;
use crate::plane::manager::PlaneAllocator;
use crate::{HwcError, Result};
use utils::{log, Context};

use std::fmt::Write;
use std::sync::Arc;

/// Callbacks into the display server
///
/// Called from the vsync and uevent threads, so implementations must
/// not call back into the composer.
pub trait HwcProcs: Send + Sync {
    fn on_vsync(&self, display: usize, timestamp: i64);

    fn on_hotplug(&self, display: usize, connected: bool);

    /// Ask the server for a new frame
    fn invalidate(&self) {}
}

/// Composition state of every display
///
/// Initialization brings up the buffer manager, the plane allocator,
/// the displays with their vsync threads and finally the uevent
/// listener. Teardown goes the other way around.
pub struct Hwcomposer {
    hc_config: HwcConfig,
    hc_procs: Arc<dyn HwcProcs>,
    hc_bm: BufferManager,
    hc_planes: PlaneAllocator,
    /// Indexed by display id. None if the display failed to come up.
    hc_devices: Vec<Option<DisplayDevice>>,
    hc_hotplug: HotplugEventQueue,
    hc_uevent: Option<UeventObserver>,
    hc_initialized: bool,
}

impl Hwcomposer {
    pub fn initialize(
        config: HwcConfig,
        display_backend: Arc<dyn DisplayBackend>,
        buffer_backend: Arc<dyn BufferBackend>,
        procs: Arc<dyn HwcProcs>,
    ) -> utils::Result<Self> {
        config.validate()?;

        let bm = BufferManager::new(buffer_backend);
        let mut planes =
            PlaneAllocator::new(&config.planes).context("Could not create plane allocator")?;

        let mut devices = Vec::new();
        for (i, kind) in config.displays.iter().enumerate() {
            let mut device =
                DisplayDevice::new(i, *kind, display_backend.clone(), config.limits.clone());
            let res = device.initialize(&mut planes, &config.vsync, procs.clone());
            if res.is_err() {
                device.deinitialize(&mut planes, &bm);
            }
            match res {
                Ok(()) => devices.push(Some(device)),
                Err(e) if *kind == DeviceKind::Primary => {
                    for d in devices.iter_mut().flatten() {
                        d.deinitialize(&mut planes, &bm);
                    }
                    return Err(e).context(format!("Could not initialize primary display {}", i));
                }
                Err(e) => {
                    log::warn!("Display {} ({:?}) is not available: {}", i, kind, e);
                    devices.push(None);
                }
            }
        }

        let hotplug = HotplugEventQueue::new();
        let hotpluggable: Vec<(usize, bool)> = devices
            .iter()
            .flatten()
            .filter(|d| d.kind() == DeviceKind::External)
            .map(|d| (d.index(), d.is_connected()))
            .collect();

        let uevent = match display_backend.uevent_fd() {
            Some(fd) => match UeventObserver::new(
                fd,
                display_backend.clone(),
                procs.clone(),
                hotplug.clone(),
                hotpluggable,
            ) {
                Ok(o) => Some(o),
                Err(e) => {
                    log::warn!("Hotplug detection disabled: {}", e);
                    None
                }
            },
            None => {
                log::info!("No uevent source, hotplug detection disabled");
                None
            }
        };

        log::info!("Composer initialized with {} displays", devices.len());
        Ok(Self {
            hc_config: config,
            hc_procs: procs,
            hc_bm: bm,
            hc_planes: planes,
            hc_devices: devices,
            hc_hotplug: hotplug,
            hc_uevent: uevent,
            hc_initialized: true,
        })
    }

    pub fn config(&self) -> &HwcConfig {
        &self.hc_config
    }

    pub fn display(&self, display: usize) -> Option<&DisplayDevice> {
        self.hc_devices.get(display).and_then(|d| d.as_ref())
    }

    pub fn display_count(&self) -> usize {
        self.hc_devices.len()
    }

    pub fn planes(&self) -> &PlaneAllocator {
        &self.hc_planes
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.hc_bm
    }

    pub fn hotplug_queue(&self) -> &HotplugEventQueue {
        &self.hc_hotplug
    }

    fn check_initialized(&self) -> Result<()> {
        match self.hc_initialized {
            true => Ok(()),
            false => Err(HwcError::NOT_INITIALIZED),
        }
    }

    fn device_mut(&mut self, display: usize) -> Result<&mut DisplayDevice> {
        self.check_initialized()?;
        self.hc_devices
            .get_mut(display)
            .and_then(|d| d.as_mut())
            .ok_or(HwcError::INVALID_DISPLAY)
    }

    /// Apply the hotplug events that arrived since the last call
    fn process_hotplug(&mut self) {
        let events = self.hc_hotplug.drain();
        if events.is_empty() {
            return;
        }

        for ev in events {
            match self.hc_devices.get_mut(ev.pe_display).and_then(|d| d.as_mut()) {
                Some(device) => device.on_hotplug(
                    ev.pe_kind.is_connected(),
                    &mut self.hc_planes,
                    &self.hc_bm,
                ),
                None => log::error!("Hotplug event for unknown display {}", ev.pe_display),
            }
        }
        self.hc_procs.invalidate();
    }

    /// Decide the composition of the next frame on every display
    ///
    /// `displays` is indexed by display id. Missing entries and `None`
    /// mean the display has nothing to show.
    pub fn prepare(&mut self, displays: &mut [Option<DisplayContents>]) -> Result<()> {
        self.check_initialized()?;
        log::trace!("prepare {} displays", displays.len());

        self.process_hotplug();
        self.hc_planes.disable_reclaimed_planes(&self.hc_bm);

        for (i, device) in self.hc_devices.iter_mut().enumerate() {
            let device = match device {
                Some(d) => d,
                None => continue,
            };
            let contents = displays.get_mut(i).and_then(|c| c.as_mut());
            if let Err(e) = device.prepare(contents, &mut self.hc_planes, &self.hc_bm) {
                log::error!("Display {}: prepare failed: {}", i, e);
            }
        }
        Ok(())
    }

    /// Show the frame decided by the last prepare
    pub fn commit(&mut self, displays: &mut [Option<DisplayContents>]) -> Result<()> {
        self.check_initialized()?;

        for (i, device) in self.hc_devices.iter_mut().enumerate() {
            let device = match device {
                Some(d) => d,
                None => continue,
            };
            let contents = displays.get_mut(i).and_then(|c| c.as_mut());
            if let Err(e) = device.commit(contents, &mut self.hc_planes, &self.hc_bm) {
                log::error!("Display {}: commit failed: {}", i, e);
            }
        }

        self.hc_planes.retire_frame();
        Ok(())
    }

    pub fn vsync_control(&mut self, display: usize, enabled: bool) -> Result<()> {
        match self.device_mut(display)?.vsync_control(enabled) {
            true => Ok(()),
            false => Err(HwcError::HARDWARE_FAILURE),
        }
    }

    pub fn blank(&mut self, display: usize, blank: bool) -> Result<()> {
        self.process_hotplug();
        self.device_mut(display)?.blank(blank)
    }

    pub fn set_power_mode(&mut self, display: usize, mode: PowerMode) -> Result<()> {
        self.process_hotplug();
        self.device_mut(display)?.set_power_mode(mode)
    }

    /// Config ids of a display. Pending hotplug events are applied first
    /// so a display reported connected can be queried right away.
    pub fn get_display_configs(&mut self, display: usize) -> Result<Vec<usize>> {
        self.process_hotplug();
        self.device_mut(display)?.get_display_configs()
    }

    pub fn get_display_attributes(
        &mut self,
        display: usize,
        config: usize,
        attributes: &[DisplayAttribute],
    ) -> Result<Vec<i32>> {
        self.process_hotplug();
        self.device_mut(display)?
            .get_display_attributes(config, attributes)
    }

    pub fn get_active_config(&mut self, display: usize) -> Result<usize> {
        self.process_hotplug();
        self.device_mut(display)?.get_active_config()
    }

    pub fn set_active_config(&mut self, display: usize, config: usize) -> Result<()> {
        self.process_hotplug();
        self.device_mut(display)?.set_active_config(config)
    }

    /// Allocate a scanout buffer, returning its fb id and stride
    pub fn alloc_frame_buffer(&mut self, width: u32, height: u32) -> Result<(u32, u32)> {
        self.check_initialized()?;
        self.hc_bm.alloc_frame_buffer(width, height)
    }

    pub fn free_frame_buffer(&mut self, fb: u32) {
        self.hc_bm.free_frame_buffer(fb);
    }

    /// Human readable state of everything
    pub fn dump(&self) -> String {
        let mut d = String::new();
        let _ = writeln!(
            d,
            "Hardware composer state ({} displays, {} pending hotplug events)",
            self.hc_devices.len(),
            self.hc_hotplug.len()
        );
        for (i, device) in self.hc_devices.iter().enumerate() {
            match device {
                Some(dev) => dev.dump(&mut d),
                None => {
                    let _ = writeln!(d, "Display {}: not available", i);
                }
            }
        }
        self.hc_planes.dump(&mut d);
        self.hc_bm.dump(&mut d);
        d
    }

    pub fn deinitialize(&mut self) {
        if !self.hc_initialized {
            return;
        }
        log::info!("Shutting down composer");

        if let Some(mut uevent) = self.hc_uevent.take() {
            uevent.deinitialize();
        }
        for device in self.hc_devices.iter_mut().rev().flatten() {
            device.deinitialize(&mut self.hc_planes, &self.hc_bm);
        }
        self.hc_devices.clear();
        self.hc_hotplug.drain();
        self.hc_planes.deinitialize(&self.hc_bm);
        self.hc_bm.deinitialize();
        self.hc_initialized = false;
    }
}

impl Drop for Hwcomposer {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
