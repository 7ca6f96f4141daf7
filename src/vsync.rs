// Vsync event generation
//
// Every display gets a thread delivering vsync callbacks. Displays with a
// vsync interrupt forward the hardware events, everything else gets them
// generated from the monotonic clock at the display's refresh period.
use crate::backend::DisplayBackend;
use crate::hwc::HwcProcs;
use crate::{HwcError, Result};
use utils::fdwatch::{FdWatch, Waker};
use utils::log;
use utils::timing::get_monotonic_nanos;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Timestamps kept around for the client thread
const TIMESTAMP_QUEUE_DEPTH: usize = 8;

/// Where a display's vsync comes from
#[derive(Debug)]
pub enum VsyncSource {
    /// An fd that becomes readable on every vsync interrupt
    Hardware(OwnedFd),
    /// Generated on a timer
    Software { period_ns: i64 },
}

enum VsyncControl {
    Enable(bool),
    Period(i64),
    Exit,
}

/// Next software vsync after `last`
///
/// Normally one period after the last one. If that point has already
/// passed, skip ahead to the next point in phase with `last` so we
/// never fall further and further behind.
pub fn next_deadline(last: i64, period: i64, now: i64) -> i64 {
    if period <= 0 {
        return now;
    }
    if last + period >= now {
        return last + period;
    }
    now + (period - ((now - last) % period))
}

/// State shared with the vsync thread
struct VsyncThread {
    vt_display: usize,
    vt_procs: Arc<dyn HwcProcs>,
    vt_control: Receiver<VsyncControl>,
    vt_timestamps: Sender<i64>,
    vt_exit: Arc<AtomicBool>,
    vt_enabled: bool,
}

impl VsyncThread {
    fn deliver(&self, timestamp: i64) {
        log::trace!("vsync {} at {}", self.vt_display, timestamp);
        self.vt_procs.on_vsync(self.vt_display, timestamp);
        // a full queue means nobody is draining it, the callback is
        // what matters
        let _ = self.vt_timestamps.try_send(timestamp);
    }

    fn software_loop(mut self, mut period: i64) {
        let mut last = get_monotonic_nanos();

        while !self.vt_exit.load(Ordering::Acquire) {
            let msg = match self.vt_enabled {
                false => self.vt_control.recv().map_err(|_| RecvTimeoutError::Disconnected),
                true => {
                    let now = get_monotonic_nanos();
                    let deadline = next_deadline(last, period, now);
                    let wait = Duration::from_nanos((deadline - now).max(0) as u64);
                    match self.vt_control.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {
                            last = deadline;
                            self.deliver(deadline);
                            continue;
                        }
                        other => other,
                    }
                }
            };

            match msg {
                Ok(VsyncControl::Enable(enabled)) => {
                    if enabled && !self.vt_enabled {
                        last = get_monotonic_nanos();
                    }
                    self.vt_enabled = enabled;
                }
                Ok(VsyncControl::Period(p)) => period = p,
                Ok(VsyncControl::Exit) | Err(_) => break,
            }
        }
        log::debug!("Software vsync thread {} exiting", self.vt_display);
    }

    fn hardware_loop(mut self, fd: OwnedFd, mut watch: FdWatch) {
        let raw = fd.as_raw_fd();
        let mut file = File::from(fd);
        watch.add_fd(raw);
        let mut buf = [0u8; 64];

        while !self.vt_exit.load(Ordering::Acquire) {
            let ready = watch.wait_for_events(None);

            loop {
                match self.vt_control.try_recv() {
                    Ok(VsyncControl::Enable(enabled)) => self.vt_enabled = enabled,
                    Ok(VsyncControl::Period(_)) => {}
                    Ok(VsyncControl::Exit) | Err(TryRecvError::Disconnected) => {
                        self.vt_exit.store(true, Ordering::Release);
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }
            if !ready || !watch.is_ready(raw) || self.vt_exit.load(Ordering::Acquire) {
                continue;
            }

            let len = match file.read(&mut buf) {
                Ok(0) => {
                    log::error!("Vsync fd of display {} closed", self.vt_display);
                    break;
                }
                Ok(len) => len,
                Err(e) => {
                    log::error!("Could not read vsync event: {}", e);
                    continue;
                }
            };
            if self.vt_enabled {
                self.deliver(parse_vsync_event(&buf[..len]));
            }
        }
        watch.remove_fd(raw);
        log::debug!("Hardware vsync thread {} exiting", self.vt_display);
    }
}

/// Timestamp of a `VSYNC=<ns>` event, or now if it carries none
fn parse_vsync_event(payload: &[u8]) -> i64 {
    std::str::from_utf8(payload)
        .ok()
        .map(|s| s.trim_end_matches('\0').trim())
        .and_then(|s| s.strip_prefix("VSYNC="))
        .and_then(|ts| ts.parse::<i64>().ok())
        .unwrap_or_else(get_monotonic_nanos)
}

/// Owns the vsync thread of one display
pub struct VsyncObserver {
    vo_display: usize,
    vo_backend: Arc<dyn DisplayBackend>,
    vo_hardware: bool,
    vo_enabled: bool,
    vo_period: i64,
    vo_control: Sender<VsyncControl>,
    vo_timestamps: Receiver<i64>,
    vo_exit: Arc<AtomicBool>,
    /// Interrupts the hardware thread's wait
    vo_waker: Option<Waker>,
    vo_thread: Option<JoinHandle<()>>,
}

impl VsyncObserver {
    /// Start the vsync thread for a display, disabled
    pub fn new(
        display: usize,
        source: VsyncSource,
        backend: Arc<dyn DisplayBackend>,
        procs: Arc<dyn HwcProcs>,
    ) -> Result<Self> {
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (ts_tx, ts_rx) = crossbeam_channel::bounded(TIMESTAMP_QUEUE_DEPTH);
        let exit = Arc::new(AtomicBool::new(false));

        let thread = VsyncThread {
            vt_display: display,
            vt_procs: procs,
            vt_control: control_rx,
            vt_timestamps: ts_tx,
            vt_exit: exit.clone(),
            vt_enabled: false,
        };

        let builder = std::thread::Builder::new().name(format!("vsync-{}", display));
        let (hardware, period, waker, handle) = match source {
            VsyncSource::Hardware(fd) => {
                let mut watch = FdWatch::new();
                let waker = watch.create_waker().map_err(|e| {
                    log::error!("Could not create vsync wake pipe: {}", e);
                    HwcError::THREAD_FAILURE
                })?;
                let handle = builder.spawn(move || thread.hardware_loop(fd, watch));
                (true, 0, Some(waker), handle)
            }
            VsyncSource::Software { period_ns } => {
                let handle = builder.spawn(move || thread.software_loop(period_ns));
                (false, period_ns, None, handle)
            }
        };
        let handle = handle.map_err(|e| {
            log::error!("Could not spawn vsync thread: {}", e);
            HwcError::THREAD_FAILURE
        })?;

        log::debug!(
            "Display {}: {} vsync",
            display,
            match hardware {
                true => "hardware",
                false => "software",
            }
        );

        Ok(Self {
            vo_display: display,
            vo_backend: backend,
            vo_hardware: hardware,
            vo_enabled: false,
            vo_period: period,
            vo_control: control_tx,
            vo_timestamps: ts_rx,
            vo_exit: exit,
            vo_waker: waker,
            vo_thread: Some(handle),
        })
    }

    fn send(&self, msg: VsyncControl) -> bool {
        let ok = self.vo_control.send(msg).is_ok();
        if let Some(waker) = self.vo_waker.as_ref() {
            waker.wake();
        }
        ok
    }

    /// Turn vsync callbacks on or off
    pub fn control(&mut self, enabled: bool) -> bool {
        if self.vo_thread.is_none() {
            return false;
        }
        if self.vo_enabled == enabled {
            return true;
        }

        if self.vo_hardware {
            if let Err(e) = self.vo_backend.vsync_control(self.vo_display, enabled) {
                log::error!(
                    "Display {}: could not switch vsync interrupts: {}",
                    self.vo_display,
                    e
                );
                return false;
            }
        }
        if !self.send(VsyncControl::Enable(enabled)) {
            return false;
        }

        self.vo_enabled = enabled;
        true
    }

    /// Change the software refresh period
    pub fn set_period(&mut self, period_ns: i64) {
        if self.vo_hardware || period_ns <= 0 {
            return;
        }
        self.vo_period = period_ns;
        self.send(VsyncControl::Period(period_ns));
    }

    pub fn is_enabled(&self) -> bool {
        self.vo_enabled
    }

    pub fn is_hardware(&self) -> bool {
        self.vo_hardware
    }

    pub fn period(&self) -> i64 {
        self.vo_period
    }

    /// The newest vsync timestamp since the last call
    pub fn last_vsync(&self) -> Option<i64> {
        self.vo_timestamps.try_iter().last()
    }

    /// Stop and join the thread
    pub fn deinitialize(&mut self) {
        let handle = match self.vo_thread.take() {
            Some(h) => h,
            None => return,
        };

        if self.vo_enabled && self.vo_hardware {
            let _ = self.vo_backend.vsync_control(self.vo_display, false);
        }
        self.vo_enabled = false;
        self.vo_exit.store(true, Ordering::Release);
        self.send(VsyncControl::Exit);
        if handle.join().is_err() {
            log::error!("Vsync thread of display {} panicked", self.vo_display);
        }
    }
}

impl Drop for VsyncObserver {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
