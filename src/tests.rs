// Whole composer tests
//
// These drive `Hwcomposer` the way a display server would, on top of
// the headless backend.
use crate as sq;
use sq::{
    next_deadline, BufferUsage, CompositionType, ContentsFlags, DetectedDisplay, DeviceKind,
    DisplayAttribute, DisplayContents, DisplayState, HeadlessBackend, HwcConfig, HwcError,
    HwcProcs, Hwcomposer, Layer, ModeInfo, PixelFormat, PlaneRef, PlaneType, PowerMode,
    VsyncObserver, VsyncSource,
};

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct RecordingProcs {
    vsyncs: Mutex<Vec<(usize, i64)>>,
    hotplugs: Mutex<Vec<(usize, bool)>>,
    invalidates: AtomicUsize,
}

impl HwcProcs for RecordingProcs {
    fn on_vsync(&self, display: usize, timestamp: i64) {
        self.vsyncs.lock().push((display, timestamp));
    }

    fn on_hotplug(&self, display: usize, connected: bool) {
        self.hotplugs.lock().push((display, connected));
    }

    fn invalidate(&self) {
        self.invalidates.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll until `f` holds, for at most two seconds
fn wait_for<F: FnMut() -> bool>(mut f: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

fn config(displays: Vec<DeviceKind>) -> HwcConfig {
    HwcConfig {
        displays,
        ..HwcConfig::default()
    }
}

fn start(
    backend: &Arc<HeadlessBackend>,
    config: HwcConfig,
) -> (Arc<RecordingProcs>, Hwcomposer) {
    let procs = Arc::new(RecordingProcs::default());
    let hwc = Hwcomposer::initialize(config, backend.clone(), backend.clone(), procs.clone())
        .unwrap();
    (procs, hwc)
}

fn target(backend: &HeadlessBackend) -> Layer {
    let buf = backend.import_buffer(
        PixelFormat::Bgra8888,
        1920,
        1080,
        BufferUsage::HW_COMPOSER | BufferUsage::HW_FB,
    );
    Layer::framebuffer_target(&buf)
}

/// One full screen RGB layer and the framebuffer target
fn single_layer(backend: &HeadlessBackend) -> DisplayContents {
    let buf = backend.import_buffer(PixelFormat::Rgba8888, 1920, 1080, BufferUsage::HW_COMPOSER);
    DisplayContents::new(vec![Layer::from_buffer(&buf), target(backend)])
}

fn frame(hwc: &mut Hwcomposer, displays: &mut [Option<DisplayContents>]) {
    hwc.prepare(displays).unwrap();
    hwc.commit(displays).unwrap();
    for contents in displays.iter_mut().flatten() {
        contents.dc_flags = ContentsFlags::empty();
    }
}

fn types(contents: &DisplayContents) -> Vec<CompositionType> {
    contents
        .dc_layers
        .iter()
        .map(|l| l.l_assignment.a_type)
        .collect()
}

#[test]
fn single_layer_scans_out_on_primary() {
    let backend = Arc::new(HeadlessBackend::new(1));
    let (_procs, mut hwc) = start(&backend, config(vec![DeviceKind::Primary]));
    let mut displays = vec![Some(single_layer(&backend))];

    hwc.prepare(&mut displays).unwrap();
    let contents = displays[0].as_ref().unwrap();
    assert_eq!(contents.gpu_layer_count(), 0);
    assert_eq!(
        contents.dc_layers[0].l_assignment.a_plane,
        Some(PlaneRef::new(PlaneType::Primary, 0))
    );

    hwc.commit(&mut displays).unwrap();
    let flip = backend.last_flip(0).unwrap();
    assert_eq!(flip.fr_planes.len(), 1);
    assert_eq!(
        flip.fr_planes[0].pf_handle,
        displays[0].as_ref().unwrap().dc_layers[0].l_handle
    );
    assert!(flip.fr_disabled.is_empty());
}

#[test]
fn fences_signal_when_the_frame_is_replaced() {
    let backend = Arc::new(HeadlessBackend::new(1));
    let (_procs, mut hwc) = start(&backend, config(vec![DeviceKind::Primary]));
    let mut displays = vec![Some(single_layer(&backend))];

    frame(&mut hwc, &mut displays);
    let contents = displays[0].as_ref().unwrap();
    let retire = contents.dc_retire_fence.clone().unwrap();
    let release = contents.dc_layers[0].l_release_fence.clone().unwrap();
    // the target was not scanned out this frame
    assert!(contents.dc_layers[1].l_release_fence.is_none());
    assert!(!retire.is_signaled());
    assert!(!release.wait(Duration::from_millis(1)));

    frame(&mut hwc, &mut displays);
    assert!(retire.is_signaled());
    assert!(release.wait(Duration::from_millis(1)));
    let next = displays[0].as_ref().unwrap().dc_retire_fence.clone().unwrap();
    assert!(next.point() > retire.point());
    assert!(!next.is_signaled());

    // everything is released on teardown
    hwc.deinitialize();
    assert!(next.is_signaled());
    assert_eq!(backend.live_mappings(), 0);
}

#[test]
fn commit_without_prepare_does_nothing() {
    let backend = Arc::new(HeadlessBackend::new(1));
    let (_procs, mut hwc) = start(&backend, config(vec![DeviceKind::Primary]));
    let mut displays = vec![Some(single_layer(&backend))];

    hwc.commit(&mut displays).unwrap();
    assert!(backend.flips(0).is_empty());
    assert!(displays[0].as_ref().unwrap().dc_retire_fence.is_none());

    // nor does a second commit for one prepare
    hwc.prepare(&mut displays).unwrap();
    hwc.commit(&mut displays).unwrap();
    hwc.commit(&mut displays).unwrap();
    assert_eq!(backend.flips(0).len(), 1);
}

#[test]
fn displays_never_share_planes() {
    let backend = Arc::new(HeadlessBackend::new(2));
    let (_procs, mut hwc) = start(&backend, HwcConfig::default());

    let video = |x: i32| {
        let buf = backend.import_buffer(PixelFormat::Nv12, 640, 480, BufferUsage::HW_COMPOSER);
        Layer::from_buffer(&buf).with_frame(x, 0, 640, 480)
    };
    let mut displays = vec![
        Some(DisplayContents::new(vec![
            video(0),
            video(640),
            video(1280),
            target(&backend),
        ])),
        Some(DisplayContents::new(vec![
            video(0),
            video(640),
            video(1280),
            target(&backend),
        ])),
    ];

    frame(&mut hwc, &mut displays);
    let mut seen = HashSet::new();
    for contents in displays.iter().flatten() {
        for plane in contents.dc_layers.iter().filter_map(|l| l.l_assignment.a_plane) {
            assert!(seen.insert(plane), "{} used twice", plane);
        }
    }
    let overlays = seen
        .iter()
        .filter(|p| p.pr_type == PlaneType::Overlay)
        .count();
    assert!(overlays <= hwc.config().planes.overlay);
}

#[test]
fn disconnect_forces_gpu_composition() {
    let backend = Arc::new(HeadlessBackend::new(2));
    let (procs, mut hwc) = start(&backend, HwcConfig::default());
    let mut displays = vec![Some(single_layer(&backend)), Some(single_layer(&backend))];

    frame(&mut hwc, &mut displays);
    let external_primary = PlaneRef::new(PlaneType::Primary, 1);
    assert_eq!(
        displays[1].as_ref().unwrap().dc_layers[0].l_assignment.a_plane,
        Some(external_primary)
    );
    let retire = displays[1].as_ref().unwrap().dc_retire_fence.clone().unwrap();
    let flips = backend.flips(1).len();

    // the cable is pulled between two frames
    backend.disconnect(1);
    assert!(backend.send_drm_hotplug());
    // the event is queued before the callback fires
    assert!(wait_for(|| procs.hotplugs.lock().len() == 1));
    assert_eq!(hwc.hotplug_queue().len(), 1);
    assert_eq!(*procs.hotplugs.lock(), vec![(1, false)]);

    hwc.prepare(&mut displays).unwrap();
    assert_eq!(hwc.display(1).unwrap().state(), DisplayState::Disconnected);
    assert_eq!(
        types(displays[1].as_ref().unwrap()),
        vec![CompositionType::Framebuffer, CompositionType::FramebufferTarget]
    );
    assert!(retire.is_signaled());
    assert!(hwc.planes().planes_of(1).is_empty());
    assert!(hwc.planes().is_reclaimed(external_primary));
    assert!(procs.invalidates.load(Ordering::SeqCst) >= 1);

    hwc.commit(&mut displays).unwrap();
    assert_eq!(backend.flips(1).len(), flips);
    assert_eq!(
        hwc.get_display_configs(1).unwrap_err(),
        HwcError::NOT_CONNECTED
    );

    // the primary display carried on
    assert_eq!(displays[0].as_ref().unwrap().gpu_layer_count(), 0);
}

#[test]
fn reconnect_redraws_on_the_gpu_once() {
    let backend = Arc::new(HeadlessBackend::new(2));
    let (procs, mut hwc) = start(&backend, HwcConfig::default());
    let mut displays = vec![Some(single_layer(&backend)), Some(single_layer(&backend))];
    frame(&mut hwc, &mut displays);

    backend.disconnect(1);
    backend.send_drm_hotplug();
    assert!(wait_for(|| procs.hotplugs.lock().len() == 1));
    frame(&mut hwc, &mut displays);

    backend.connect(1, HeadlessBackend::default_display());
    backend.send_drm_hotplug();
    assert!(wait_for(|| procs.hotplugs.lock().len() == 2));
    assert_eq!(*procs.hotplugs.lock(), vec![(1, false), (1, true)]);

    hwc.prepare(&mut displays).unwrap();
    assert_eq!(
        hwc.display(1).unwrap().state(),
        DisplayState::Connected(PowerMode::On)
    );
    assert_eq!(displays[1].as_ref().unwrap().gpu_layer_count(), 1);
    hwc.commit(&mut displays).unwrap();

    // the old primary plane needs two frames before it can be reused
    let mut on_plane = false;
    for _ in 0..3 {
        frame(&mut hwc, &mut displays);
        if displays[1].as_ref().unwrap().gpu_layer_count() == 0 {
            on_plane = true;
            break;
        }
    }
    assert!(on_plane);
    assert_eq!(
        hwc.display(1).unwrap().primary_plane(),
        Some(PlaneRef::new(PlaneType::Primary, 1))
    );
}

#[test]
fn hdmi_switch_uevent() {
    let backend = Arc::new(HeadlessBackend::new(2));
    let (procs, mut hwc) = start(&backend, HwcConfig::default());

    assert!(backend.send_uevent(b"change@/devices/virtual/switch/hdmi\0SWITCH_STATE=0\0"));
    assert!(wait_for(|| procs.hotplugs.lock().len() == 1));
    assert_eq!(*procs.hotplugs.lock(), vec![(1, false)]);

    let mut displays = vec![None, Some(single_layer(&backend))];
    hwc.prepare(&mut displays).unwrap();
    assert!(!hwc.display(1).unwrap().is_connected());
    assert_eq!(displays[1].as_ref().unwrap().gpu_layer_count(), 1);
}

#[test]
fn unchanged_connection_is_not_reported() {
    let backend = Arc::new(HeadlessBackend::new(2));
    let (procs, hwc) = start(&backend, HwcConfig::default());

    assert!(backend.send_uevent(b"add@/devices/platform/usb\0ACTION=add\0"));
    assert!(backend.send_drm_hotplug());
    std::thread::sleep(Duration::from_millis(50));
    assert!(hwc.hotplug_queue().is_empty());
    assert!(procs.hotplugs.lock().is_empty());
}

#[test]
fn blanked_display_composes_on_the_gpu() {
    let backend = Arc::new(HeadlessBackend::new(1));
    let (_procs, mut hwc) = start(&backend, config(vec![DeviceKind::Primary]));
    let mut displays = vec![Some(single_layer(&backend))];
    frame(&mut hwc, &mut displays);
    let flips = backend.flips(0).len();

    hwc.blank(0, true).unwrap();
    assert!(backend.is_blanked(0));
    assert_eq!(
        hwc.display(0).unwrap().state(),
        DisplayState::Connected(PowerMode::Off)
    );
    frame(&mut hwc, &mut displays);
    assert_eq!(displays[0].as_ref().unwrap().gpu_layer_count(), 1);
    assert_eq!(backend.flips(0).len(), flips);

    // standby still scans out
    hwc.set_power_mode(0, PowerMode::Standby).unwrap();
    assert!(!backend.is_blanked(0));
    frame(&mut hwc, &mut displays);
    assert_eq!(displays[0].as_ref().unwrap().gpu_layer_count(), 0);
    assert_eq!(backend.flips(0).len(), flips + 1);
}

#[test]
fn power_requests_need_a_connection() {
    let backend = Arc::new(HeadlessBackend::new(2));
    backend.disconnect(1);
    let (_procs, mut hwc) = start(&backend, HwcConfig::default());

    assert_eq!(
        hwc.set_power_mode(1, PowerMode::On).unwrap_err(),
        HwcError::NOT_CONNECTED
    );
    assert_eq!(hwc.blank(5, true).unwrap_err(), HwcError::INVALID_DISPLAY);
}

#[test]
fn display_configs_and_attributes() {
    let backend = Arc::new(HeadlessBackend::new(2));
    backend.connect(
        1,
        DetectedDisplay {
            dt_modes: vec![ModeInfo {
                mi_width: 1280,
                mi_height: 720,
                mi_refresh: 60,
                mi_preferred: true,
            }],
            dt_physical_mm: (0, 0),
        },
    );
    let (_procs, mut hwc) = start(&backend, HwcConfig::default());
    let all = [
        DisplayAttribute::VsyncPeriod,
        DisplayAttribute::Width,
        DisplayAttribute::Height,
        DisplayAttribute::DpiX,
        DisplayAttribute::DpiY,
    ];

    // 1080p at 60 and 50Hz, the 720p mode has another resolution
    assert_eq!(hwc.get_display_configs(0).unwrap(), vec![0, 1]);
    assert_eq!(
        hwc.get_display_attributes(0, 0, &all).unwrap(),
        vec![16_666_666, 1920, 1080, 92_000, 92_000]
    );
    assert_eq!(
        hwc.get_display_attributes(0, 1, &[DisplayAttribute::VsyncPeriod]).unwrap(),
        vec![20_000_000]
    );
    assert_eq!(
        hwc.get_display_attributes(0, 2, &all).unwrap_err(),
        HwcError::INVALID_CONFIG
    );

    // unknown physical size
    assert_eq!(hwc.get_display_configs(1).unwrap(), vec![0]);
    assert_eq!(
        hwc.get_display_attributes(1, 0, &all).unwrap(),
        vec![16_666_666, 1280, 720, 160_000, 160_000]
    );
}

#[test]
fn active_config() {
    let backend = Arc::new(HeadlessBackend::new(2));
    let (_procs, mut hwc) = start(&backend, HwcConfig::default());

    assert_eq!(hwc.get_active_config(0).unwrap(), 0);
    hwc.set_active_config(0, 0).unwrap();
    assert_eq!(hwc.set_active_config(0, 1).unwrap_err(), HwcError::INVALID_CONFIG);
    assert_eq!(hwc.set_active_config(0, 9).unwrap_err(), HwcError::INVALID_CONFIG);

    hwc.set_active_config(1, 1).unwrap();
    assert_eq!(hwc.get_active_config(1).unwrap(), 1);
    assert_eq!(
        backend.active_mode(1),
        Some(ModeInfo {
            mi_width: 1920,
            mi_height: 1080,
            mi_refresh: 50,
            mi_preferred: false,
        })
    );
}

#[test]
fn dummy_display_never_uses_planes() {
    let backend = Arc::new(HeadlessBackend::new(2));
    let (_procs, mut hwc) = start(&backend, config(vec![DeviceKind::Primary, DeviceKind::Dummy]));
    let mut displays = vec![None, Some(single_layer(&backend))];

    frame(&mut hwc, &mut displays);
    assert!(hwc.display(1).unwrap().is_connected());
    assert_eq!(displays[1].as_ref().unwrap().gpu_layer_count(), 1);
    assert!(backend.flips(1).is_empty());
    assert_eq!(hwc.get_display_configs(1).unwrap(), vec![0]);
    assert_eq!(
        hwc.get_display_attributes(1, 0, &[DisplayAttribute::Width]).unwrap(),
        vec![1920]
    );
}

#[test]
fn primary_failure_is_fatal() {
    let backend = Arc::new(HeadlessBackend::new(2));
    backend.fail_detect(0, true);
    let procs = Arc::new(RecordingProcs::default());
    let res = Hwcomposer::initialize(
        HwcConfig::default(),
        backend.clone(),
        backend.clone(),
        procs,
    );
    assert!(res.is_err());
}

#[test]
fn external_failure_is_not_admitted() {
    let backend = Arc::new(HeadlessBackend::new(2));
    backend.fail_detect(1, true);
    let (_procs, mut hwc) = start(&backend, HwcConfig::default());

    assert!(hwc.display(0).is_some());
    assert!(hwc.display(1).is_none());
    assert_eq!(
        hwc.get_display_configs(1).unwrap_err(),
        HwcError::INVALID_DISPLAY
    );

    // frames still work for the rest
    let mut displays = vec![Some(single_layer(&backend)), Some(single_layer(&backend))];
    frame(&mut hwc, &mut displays);
    assert_eq!(backend.flips(0).len(), 1);
}

#[test]
fn calls_after_deinitialize_fail() {
    let backend = Arc::new(HeadlessBackend::new(1));
    let (_procs, mut hwc) = start(&backend, config(vec![DeviceKind::Primary]));
    hwc.deinitialize();

    let mut displays = vec![Some(single_layer(&backend))];
    assert_eq!(hwc.prepare(&mut displays).unwrap_err(), HwcError::NOT_INITIALIZED);
    assert_eq!(hwc.blank(0, true).unwrap_err(), HwcError::NOT_INITIALIZED);
}

#[test]
fn frame_buffers() {
    let backend = Arc::new(HeadlessBackend::new(1));
    let (_procs, mut hwc) = start(&backend, config(vec![DeviceKind::Primary]));

    let (fb, stride) = hwc.alloc_frame_buffer(1920, 1080).unwrap();
    assert!(stride >= 1920 * 4);
    assert_eq!(hwc.buffers().frame_buffer_count(), 1);
    hwc.free_frame_buffer(fb);
    assert_eq!(hwc.buffers().frame_buffer_count(), 0);
    assert_eq!(hwc.alloc_frame_buffer(0, 0).unwrap_err(), HwcError::ALLOC_FAILED);
}

#[test]
fn software_deadlines() {
    assert_eq!(next_deadline(100, 10, 105), 110);
    assert_eq!(next_deadline(100, 10, 110), 110);
    // missed a few, stay in phase
    assert_eq!(next_deadline(100, 10, 131), 140);
    assert_eq!(next_deadline(100, 10, 130), 140);
}

#[test]
fn software_vsync_is_monotonic() {
    let backend = Arc::new(HeadlessBackend::new(1));
    let procs = Arc::new(RecordingProcs::default());
    let period = 5_000_000;
    let mut vsync = VsyncObserver::new(
        0,
        VsyncSource::Software { period_ns: period },
        backend.clone(),
        procs.clone(),
    )
    .unwrap();
    assert!(!vsync.is_hardware());

    assert!(vsync.control(true));
    assert!(wait_for(|| procs.vsyncs.lock().len() >= 5));
    assert!(vsync.control(false));
    std::thread::sleep(Duration::from_millis(10));
    let count = procs.vsyncs.lock().len();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(procs.vsyncs.lock().len(), count);

    let stamps: Vec<i64> = procs.vsyncs.lock().iter().map(|(_, ts)| *ts).collect();
    for pair in stamps.windows(2) {
        assert!(pair[1] > pair[0]);
        assert_eq!((pair[1] - pair[0]) % period, 0);
    }
    assert!(vsync.last_vsync().is_some());

    vsync.deinitialize();
    assert!(!vsync.control(true));
}

#[test]
fn hardware_vsync_is_forwarded() {
    let backend = Arc::new(HeadlessBackend::new(1));
    backend.set_hardware_vsync(true);
    let (procs, mut hwc) = start(&backend, config(vec![DeviceKind::Primary]));

    hwc.vsync_control(0, true).unwrap();
    assert!(backend.is_vsync_enabled(0));
    assert!(backend.send_vsync(0, 123_456));
    assert!(wait_for(|| procs.vsyncs.lock().len() == 1));
    assert_eq!(procs.vsyncs.lock()[0], (0, 123_456));

    hwc.vsync_control(0, false).unwrap();
    assert!(!backend.is_vsync_enabled(0));
    backend.send_vsync(0, 234_567);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(procs.vsyncs.lock().len(), 1);

    let mut displays = vec![Some(single_layer(&backend))];
    hwc.prepare(&mut displays).unwrap();
    assert_eq!(hwc.display(0).unwrap().last_vsync(), Some(123_456));
}

#[test]
fn config_from_toml() {
    let config = HwcConfig::from_toml_str(
        r#"
        displays = ["primary", "dummy"]

        [planes]
        overlay = 4

        [vsync]
        force_software = true
        "#,
    )
    .unwrap();
    assert_eq!(config.planes.overlay, 4);
    assert_eq!(config.planes.sprite, 3);
    assert_eq!(config.displays, vec![DeviceKind::Primary, DeviceKind::Dummy]);
    assert!(config.vsync.force_software);
    assert_eq!(config.limits, sq::CapabilityLimits::default());

    assert!(HwcConfig::from_toml_str("displays = [\"external\"]").is_err());
    assert!(HwcConfig::from_toml_str("[planes]\nsprite = 40").is_err());
    assert!(HwcConfig::from_toml_str("[planes]\nmax_per_display = 0").is_err());
    assert!(HwcConfig::from_toml_str("displays = 3").is_err());
    assert_eq!(HwcConfig::from_toml_str("").unwrap(), HwcConfig::default());
}

#[test]
fn dump_lists_every_display() {
    let backend = Arc::new(HeadlessBackend::new(2));
    let (_procs, mut hwc) = start(&backend, HwcConfig::default());
    let mut displays = vec![Some(single_layer(&backend)), None];
    frame(&mut hwc, &mut displays);

    let dump = hwc.dump();
    assert!(dump.contains("Display 0 (primary)"));
    assert!(dump.contains("Display 1 (external)"));
    assert!(dump.contains("Buffer mappings"));
}
