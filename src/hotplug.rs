// Display hotplug notifications
//
// The kernel announces connector changes with uevents. A listener thread
// turns those into `PendingEvent`s, which the client thread applies at
// the start of the next prepare.
use crate::backend::DisplayBackend;
use crate::hwc::HwcProcs;
use crate::{HwcError, Result};
use utils::fdwatch::{FdWatch, Waker};
use utils::log;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Events queued before the client gets around to a prepare
const HOTPLUG_QUEUE_DEPTH: usize = 32;
/// Largest uevent message the kernel sends
const UEVENT_BUFFER_SIZE: usize = 4096;

/// Path fragment of display engine uevents
const DRM_HOTPLUG_PATH: &str = "/drm/card";
/// The HDMI switch some boards report cable state through
const HDMI_SWITCH_PATH: &str = "/devices/virtual/switch/hdmi";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugKind {
    Connected,
    Disconnected,
}

impl HotplugKind {
    pub fn from_connected(connected: bool) -> Self {
        match connected {
            true => HotplugKind::Connected,
            false => HotplugKind::Disconnected,
        }
    }

    pub fn is_connected(self) -> bool {
        self == HotplugKind::Connected
    }
}

/// A connection change of one display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub pe_display: usize,
    pub pe_kind: HotplugKind,
}

/// FIFO of hotplug events waiting for the client thread
///
/// Clones share the same queue. Events are never merged, a quick
/// unplug and replug is delivered as two events.
#[derive(Clone)]
pub struct HotplugEventQueue {
    hq_tx: Sender<PendingEvent>,
    hq_rx: Receiver<PendingEvent>,
}

impl HotplugEventQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(HOTPLUG_QUEUE_DEPTH);
        Self {
            hq_tx: tx,
            hq_rx: rx,
        }
    }

    /// Queue an event. Returns false if the queue is full.
    pub fn push(&self, event: PendingEvent) -> bool {
        match self.hq_tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                log::error!("Hotplug queue is full, dropping {:?}", ev);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Take every queued event, oldest first
    pub fn drain(&self) -> Vec<PendingEvent> {
        self.hq_rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.hq_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hq_rx.is_empty()
    }
}

/// One kernel uevent message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub ue_action: String,
    pub ue_path: String,
    pub ue_env: HashMap<String, String>,
}

impl Uevent {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.ue_env.get(key).map(|s| s.as_str())
    }
}

/// Parse a raw uevent
///
/// The message is a list of NUL terminated records. The first is
/// `action@devpath`, the rest are `KEY=VALUE` pairs.
pub fn parse_uevent(msg: &[u8]) -> Option<Uevent> {
    let text = String::from_utf8_lossy(msg);
    let mut records = text.split('\0').filter(|r| !r.is_empty());

    let (action, path) = records.next()?.split_once('@')?;
    if action.is_empty() || path.is_empty() {
        return None;
    }

    let ue_env = records
        .filter_map(|r| r.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Some(Uevent {
        ue_action: action.to_string(),
        ue_path: path.to_string(),
        ue_env,
    })
}

/// The hotpluggable displays and what we last saw on them
struct UeventThread {
    ut_backend: Arc<dyn DisplayBackend>,
    ut_procs: Arc<dyn HwcProcs>,
    ut_queue: HotplugEventQueue,
    ut_exit: Arc<AtomicBool>,
    /// (display, connected)
    ut_displays: Vec<(usize, bool)>,
}

impl UeventThread {
    fn run(mut self, fd: OwnedFd, mut watch: FdWatch) {
        let raw = fd.as_raw_fd();
        let mut file = File::from(fd);
        watch.add_fd(raw);
        let mut buf = vec![0u8; UEVENT_BUFFER_SIZE];

        while !self.ut_exit.load(Ordering::Acquire) {
            if !watch.wait_for_events(None) || self.ut_exit.load(Ordering::Acquire) {
                continue;
            }
            if !watch.is_ready(raw) {
                continue;
            }

            let len = match file.read(&mut buf) {
                Ok(0) => {
                    log::error!("Uevent socket closed");
                    break;
                }
                Ok(len) => len,
                Err(e) => {
                    log::error!("Could not read uevent: {}", e);
                    continue;
                }
            };
            if let Some(event) = parse_uevent(&buf[..len]) {
                self.handle(&event);
            }
        }
        watch.remove_fd(raw);
        log::debug!("Uevent thread exiting");
    }

    fn handle(&mut self, event: &Uevent) {
        log::trace!("uevent {}@{}", event.ue_action, event.ue_path);

        if event.ue_path.contains(DRM_HOTPLUG_PATH) && event.get("HOTPLUG") == Some("1") {
            for i in 0..self.ut_displays.len() {
                let display = self.ut_displays[i].0;
                match self.ut_backend.detect(display) {
                    Ok(detected) => self.update(i, detected.is_some()),
                    Err(e) => log::error!("Could not detect display {}: {}", display, e),
                }
            }
        } else if event.ue_path.starts_with(HDMI_SWITCH_PATH) {
            let connected = match event.get("SWITCH_STATE") {
                Some("1") => true,
                Some("0") => false,
                _ => return,
            };
            if !self.ut_displays.is_empty() {
                self.update(0, connected);
            }
        }
    }

    fn update(&mut self, slot: usize, connected: bool) {
        let (display, was_connected) = self.ut_displays[slot];
        if connected == was_connected {
            return;
        }
        self.ut_displays[slot].1 = connected;

        log::info!(
            "Display {} {}",
            display,
            match connected {
                true => "connected",
                false => "disconnected",
            }
        );
        self.ut_queue.push(PendingEvent {
            pe_display: display,
            pe_kind: HotplugKind::from_connected(connected),
        });
        self.ut_procs.on_hotplug(display, connected);
    }
}

/// Owns the uevent listener thread
pub struct UeventObserver {
    uo_exit: Arc<AtomicBool>,
    uo_waker: Waker,
    uo_thread: Option<JoinHandle<()>>,
}

impl UeventObserver {
    /// Start listening on `fd`
    ///
    /// `displays` lists the hotpluggable displays with their current
    /// connection state. Only changes to that state are reported.
    pub fn new(
        fd: OwnedFd,
        backend: Arc<dyn DisplayBackend>,
        procs: Arc<dyn HwcProcs>,
        queue: HotplugEventQueue,
        displays: Vec<(usize, bool)>,
    ) -> Result<Self> {
        let mut watch = FdWatch::new();
        let waker = watch.create_waker().map_err(|e| {
            log::error!("Could not create uevent wake pipe: {}", e);
            HwcError::THREAD_FAILURE
        })?;
        let exit = Arc::new(AtomicBool::new(false));

        let thread = UeventThread {
            ut_backend: backend,
            ut_procs: procs,
            ut_queue: queue,
            ut_exit: exit.clone(),
            ut_displays: displays,
        };
        let handle = std::thread::Builder::new()
            .name("uevent".to_string())
            .spawn(move || thread.run(fd, watch))
            .map_err(|e| {
                log::error!("Could not spawn uevent thread: {}", e);
                HwcError::THREAD_FAILURE
            })?;

        Ok(Self {
            uo_exit: exit,
            uo_waker: waker,
            uo_thread: Some(handle),
        })
    }

    pub fn deinitialize(&mut self) {
        if let Some(handle) = self.uo_thread.take() {
            self.uo_exit.store(true, Ordering::Release);
            self.uo_waker.wake();
            if handle.join().is_err() {
                log::error!("Uevent thread panicked");
            }
        }
    }
}

impl Drop for UeventObserver {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
