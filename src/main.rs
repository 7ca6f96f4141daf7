//! # Squall demo
//!
//! Runs the composition core on the headless backend: a video layer, a
//! status bar and a cursor are composed for a few frames on the primary
//! display while the external display is unplugged and replugged. The
//! final state dump is printed.
//!
//! Usage: `squall [config.toml]`. Set `RUST_LOG=debug` to watch the
//! plane decisions.

extern crate squall;
extern crate utils;

use squall as sq;
use std::sync::Arc;
use std::time::Duration;
use utils::log;
use utils::timing::StopWatch;

const FRAMES: usize = 8;

struct Procs;

impl sq::HwcProcs for Procs {
    fn on_vsync(&self, display: usize, timestamp: i64) {
        log::trace!("vsync on {} at {}", display, timestamp);
    }

    fn on_hotplug(&self, display: usize, connected: bool) {
        log::info!("hotplug: display {} connected={}", display, connected);
    }

    fn invalidate(&self) {
        log::debug!("redraw requested");
    }
}

fn primary_contents(backend: &sq::HeadlessBackend) -> sq::DisplayContents {
    let usage = sq::BufferUsage::HW_COMPOSER;
    let video = backend.import_buffer(sq::PixelFormat::Nv12, 1280, 720, usage);
    let bar = backend.import_buffer(sq::PixelFormat::Rgba8888, 1920, 64, usage);
    let cursor = backend.import_buffer(sq::PixelFormat::Bgra8888, 64, 64, usage);
    let target = backend.import_buffer(
        sq::PixelFormat::Bgra8888,
        1920,
        1080,
        sq::BufferUsage::HW_COMPOSER | sq::BufferUsage::HW_FB,
    );

    sq::DisplayContents::new(vec![
        sq::Layer::from_buffer(&video).with_frame(0, 0, 1920, 1080),
        sq::Layer::from_buffer(&bar)
            .with_frame(0, 0, 1920, 64)
            .with_blending(sq::Blending::Premultiplied),
        sq::Layer::from_buffer(&cursor)
            .with_frame(400, 300, 64, 64)
            .with_blending(sq::Blending::Premultiplied)
            .with_flags(sq::LayerFlags::IS_CURSOR_LAYER),
        sq::Layer::framebuffer_target(&target),
    ])
}

fn external_contents(backend: &sq::HeadlessBackend) -> sq::DisplayContents {
    let desktop = backend.import_buffer(
        sq::PixelFormat::Rgbx8888,
        1920,
        1080,
        sq::BufferUsage::HW_COMPOSER,
    );
    let target = backend.import_buffer(
        sq::PixelFormat::Bgra8888,
        1920,
        1080,
        sq::BufferUsage::HW_COMPOSER | sq::BufferUsage::HW_FB,
    );
    sq::DisplayContents::new(vec![
        sq::Layer::from_buffer(&desktop),
        sq::Layer::framebuffer_target(&target),
    ])
}

fn main() -> utils::Result<()> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => sq::HwcConfig::from_file(path)?,
        None => sq::HwcConfig::default(),
    };

    let backend = Arc::new(sq::HeadlessBackend::new(config.displays.len()));
    let mut hwc =
        sq::Hwcomposer::initialize(config, backend.clone(), backend.clone(), Arc::new(Procs))?;
    hwc.vsync_control(0, true)?;

    let mut displays = vec![
        Some(primary_contents(&backend)),
        Some(external_contents(&backend)),
    ];

    let mut watch = StopWatch::new();
    for frame in 0..FRAMES {
        match frame {
            3 => {
                backend.disconnect(1);
                backend.send_drm_hotplug();
            }
            5 => {
                backend.connect(1, sq::HeadlessBackend::default_display());
                backend.send_drm_hotplug();
            }
            _ => {}
        }
        // give the uevent thread a moment to queue the change
        std::thread::sleep(Duration::from_millis(16));

        watch.start();
        hwc.prepare(&mut displays)?;
        let gpu_layers: Vec<usize> = displays
            .iter()
            .map(|d| d.as_ref().map(|c| c.gpu_layer_count()).unwrap_or(0))
            .collect();
        hwc.commit(&mut displays)?;
        watch.end();

        println!(
            "frame {}: GPU layers per display {:?}, took {:?}",
            frame,
            gpu_layers,
            watch.get_duration()
        );

        for contents in displays.iter_mut().flatten() {
            contents.dc_flags = sq::ContentsFlags::empty();
        }
    }

    print!("{}", hwc.dump());
    hwc.deinitialize();
    Ok(())
}
