// Plane assignment tests
//
use crate as sq;
use sq::{
    AssignResult, Blending, BufferManager, BufferUsage, CapabilityLimits, CompositionType,
    ContentsFlags, DisplayContents, HeadlessBackend, Layer, LayerCompositor, LayerFlags,
    PixelFormat, PlaneAllocator, PlaneCapabilities, PlaneInventory, PlaneRef, PlaneType,
    Rejection, Transform,
};

use std::collections::HashSet;
use std::sync::Arc;

struct Fixture {
    backend: Arc<HeadlessBackend>,
    bm: BufferManager,
    planes: PlaneAllocator,
    primary: Option<PlaneRef>,
    comp: LayerCompositor,
}

fn fixture(inventory: PlaneInventory) -> Fixture {
    let backend = Arc::new(HeadlessBackend::new(1));
    let bm = BufferManager::new(backend.clone());
    let mut planes = PlaneAllocator::new(&inventory).unwrap();
    let primary = planes.acquire_for(0, PlaneType::Primary);
    assert!(primary.is_some());

    Fixture {
        backend,
        bm,
        planes,
        primary,
        comp: LayerCompositor::new(0, CapabilityLimits::default()),
    }
}

impl Fixture {
    fn layer(&self, format: PixelFormat, x: i32, y: i32, w: u32, h: u32) -> Layer {
        let buf = self
            .backend
            .import_buffer(format, w, h, BufferUsage::HW_COMPOSER);
        Layer::from_buffer(&buf).with_frame(x, y, w as i32, h as i32)
    }

    fn target(&self) -> Layer {
        let buf = self.backend.import_buffer(
            PixelFormat::Bgra8888,
            1920,
            1080,
            BufferUsage::HW_COMPOSER | BufferUsage::HW_FB,
        );
        Layer::framebuffer_target(&buf)
    }

    fn assign(&mut self, layers: &mut [Layer]) -> AssignResult {
        self.comp
            .assign_planes(layers, &mut self.planes, &self.bm, self.primary)
    }
}

fn types(layers: &[Layer]) -> Vec<CompositionType> {
    layers.iter().map(|l| l.l_assignment.a_type).collect()
}

fn assert_exclusive(layers: &[Layer]) {
    let mut seen = HashSet::new();
    for plane in layers.iter().filter_map(|l| l.l_assignment.a_plane) {
        assert!(seen.insert(plane), "{} assigned twice", plane);
    }
}

#[test]
fn single_layer_goes_on_primary() {
    let mut f = fixture(PlaneInventory::default());
    let mut layers = vec![
        f.layer(PixelFormat::Rgba8888, 0, 0, 1920, 1080),
        f.target(),
    ];

    assert_eq!(f.assign(&mut layers), AssignResult::Success);
    assert_eq!(layers[0].l_assignment.a_type, CompositionType::Overlay);
    assert_eq!(layers[0].l_assignment.a_plane, f.primary);
    assert_eq!(layers[1].l_assignment.a_type, CompositionType::FramebufferTarget);
    assert_eq!(layers[1].l_assignment.a_plane, None);
    assert_eq!(
        layers
            .iter()
            .filter(|l| l.l_assignment.a_type == CompositionType::Framebuffer)
            .count(),
        0
    );
}

#[test]
fn fifth_overlay_layer_is_demoted() {
    let mut f = fixture(PlaneInventory {
        primary: 1,
        sprite: 0,
        overlay: 4,
        cursor: 0,
        max_per_display: 5,
    });

    // layer 2 is the smallest and so has the lowest priority
    let sizes = [(320, 240), (400, 240), (128, 64), (480, 240), (640, 240)];
    let mut layers: Vec<Layer> = sizes
        .iter()
        .enumerate()
        .map(|(i, (w, h))| f.layer(PixelFormat::Nv12, 0, i as i32 * 250, *w, *h))
        .collect();
    layers.push(f.target());

    assert_eq!(f.assign(&mut layers), AssignResult::Success);
    assert_exclusive(&layers);
    for i in [0, 1, 3, 4] {
        assert_eq!(layers[i].l_assignment.a_type, CompositionType::Overlay);
        assert_eq!(
            layers[i].l_assignment.a_plane.map(|p| p.pr_type),
            Some(PlaneType::Overlay)
        );
    }
    assert_eq!(layers[2].l_assignment, sq::Assignment::gpu());
    // the GPU drawn layer needs the target on screen
    assert_eq!(layers[5].l_assignment.a_plane, f.primary);
}

#[test]
fn cursor_layer_uses_cursor_plane() {
    let mut f = fixture(PlaneInventory::default());
    let mut layers = vec![
        f.layer(PixelFormat::Rgba8888, 0, 0, 1920, 1080),
        f.layer(PixelFormat::Bgra8888, 100, 100, 64, 64)
            .with_flags(LayerFlags::IS_CURSOR_LAYER)
            .with_blending(Blending::Premultiplied),
        f.target(),
    ];

    assert_eq!(f.assign(&mut layers), AssignResult::Success);
    assert_eq!(
        types(&layers),
        vec![
            CompositionType::Overlay,
            CompositionType::CursorOverlay,
            CompositionType::FramebufferTarget
        ]
    );
    assert_eq!(
        layers[1].l_assignment.a_plane,
        Some(PlaneRef::new(PlaneType::Cursor, 0))
    );
    assert_eq!(
        layers[0].l_assignment.a_plane.map(|p| p.pr_type),
        Some(PlaneType::Sprite)
    );
    // everything is on a plane, the target is not shown
    assert_eq!(layers[2].l_assignment.a_plane, None);
}

#[test]
fn assignment_is_deterministic() {
    let mut f = fixture(PlaneInventory::default());
    let mut layers = vec![
        f.layer(PixelFormat::Rgba8888, 0, 0, 1920, 1080),
        f.layer(PixelFormat::Nv12, 0, 0, 1280, 720),
        f.layer(PixelFormat::Rgba8888, 200, 200, 300, 300),
        f.layer(PixelFormat::Yuy2, 640, 360, 640, 360),
        f.layer(PixelFormat::Bgrx8888, 50, 900, 1800, 100),
        f.layer(PixelFormat::Rgb565, 10, 10, 100, 100),
        f.target(),
    ];

    assert_eq!(f.assign(&mut layers), AssignResult::Success);
    assert_exclusive(&layers);
    let first: Vec<_> = layers.iter().map(|l| l.l_assignment).collect();

    for _ in 0..5 {
        assert_eq!(f.assign(&mut layers), AssignResult::Success);
        let again: Vec<_> = layers.iter().map(|l| l.l_assignment).collect();
        assert_eq!(first, again);
    }
}

#[test]
fn missing_primary_falls_back_to_gpu() {
    let mut f = fixture(PlaneInventory::default());
    f.primary = None;
    let mut layers = vec![
        f.layer(PixelFormat::Rgba8888, 0, 0, 1920, 1080),
        f.layer(PixelFormat::Rgba8888, 0, 0, 1920, 1080)
            .with_transform(Transform::FLIP_H),
        f.target(),
    ];

    assert_eq!(f.assign(&mut layers), AssignResult::Fallback);
    assert_eq!(
        types(&layers),
        vec![
            CompositionType::Framebuffer,
            CompositionType::Framebuffer,
            CompositionType::FramebufferTarget
        ]
    );
    assert!(layers.iter().all(|l| l.l_assignment.a_plane.is_none()));
    // nothing was left acquired
    assert_eq!(f.planes.free_count(0, PlaneType::Sprite), 3);
}

#[test]
fn pinned_priority_heuristic() {
    let f = fixture(PlaneInventory::default());

    let rgb = f.layer(PixelFormat::Rgba8888, 0, 0, 100, 100);
    assert_eq!(sq::priority_score(&rgb, 2), (10000 << 4) | 2);

    let video = f.layer(PixelFormat::Nv12, 0, 0, 100, 100);
    assert_eq!(
        sq::priority_score(&video, 3),
        sq::PRIORITY_OVERLAY | (10000 << 4) | 3
    );

    let mut secure = f.layer(PixelFormat::Rgba8888, 0, 0, 10, 10);
    secure.l_usage |= BufferUsage::PROTECTED;
    assert_eq!(
        sq::priority_score(&secure, 0),
        sq::PRIORITY_PROTECTED | (100 << 4)
    );
    assert!(sq::priority_score(&secure, 0) > sq::priority_score(&video, 3));
}

#[test]
fn equal_sized_layers_prefer_higher_index() {
    // the layer index sits in the low bits of the score, so among
    // layers of the same size the one closer to the top wins
    let mut f = fixture(PlaneInventory {
        primary: 1,
        sprite: 0,
        overlay: 1,
        cursor: 0,
        max_per_display: 4,
    });
    let mut layers = vec![
        f.layer(PixelFormat::Nv12, 0, 0, 640, 480),
        f.layer(PixelFormat::Nv12, 640, 0, 640, 480),
        f.target(),
    ];

    assert_eq!(f.assign(&mut layers), AssignResult::Success);
    assert_eq!(layers[0].l_assignment.a_type, CompositionType::Framebuffer);
    assert_eq!(layers[1].l_assignment.a_type, CompositionType::Overlay);
}

#[test]
fn protected_layer_wins_the_overlay() {
    let mut f = fixture(PlaneInventory {
        primary: 1,
        sprite: 0,
        overlay: 1,
        cursor: 0,
        max_per_display: 4,
    });
    let mut small = f.layer(PixelFormat::Nv12, 0, 0, 64, 64);
    small.l_usage |= BufferUsage::PROTECTED;
    let mut layers = vec![small, f.layer(PixelFormat::Nv12, 640, 0, 640, 480), f.target()];

    assert_eq!(f.assign(&mut layers), AssignResult::Success);
    assert_eq!(layers[0].l_assignment.a_type, CompositionType::Overlay);
    assert_eq!(layers[1].l_assignment.a_type, CompositionType::Framebuffer);
}

#[test]
fn sprite_capabilities() {
    let f = fixture(PlaneInventory::default());
    let caps = PlaneCapabilities::new(CapabilityLimits::default());
    let sprite = PlaneType::Sprite;

    let ok = f.layer(PixelFormat::Bgra8888, 0, 0, 256, 256);
    assert_eq!(caps.check(sprite, &ok), Ok(()));

    assert_eq!(
        caps.check(sprite, &f.layer(PixelFormat::Nv12, 0, 0, 256, 256)),
        Err(Rejection::Format)
    );
    // rotated RGB is rejected by the format check already
    assert_eq!(
        caps.check(sprite, &ok.clone().with_transform(Transform::ROT_90)),
        Err(Rejection::Format)
    );
    assert_eq!(
        caps.check(sprite, &ok.clone().with_frame(0, 0, 512, 512)),
        Err(Rejection::Scaling)
    );
    assert_eq!(
        caps.check(sprite, &f.layer(PixelFormat::Rgba8888, 0, 0, 4097, 16)),
        Err(Rejection::Size)
    );

    let mut skipped = ok.clone().with_flags(LayerFlags::SKIP_LAYER);
    assert_eq!(caps.check(sprite, &skipped), Err(Rejection::NotComposable));
    skipped.l_flags = LayerFlags::empty();
    skipped.l_handle = 0;
    assert_eq!(caps.check(sprite, &skipped), Err(Rejection::NotComposable));

    let mut no_usage = ok.clone();
    no_usage.l_usage = BufferUsage::empty();
    assert_eq!(caps.check(sprite, &no_usage), Err(Rejection::NotComposable));

    let forced = ok.with_hint(sq::CompositionHint::ForceClient);
    assert_eq!(caps.check(sprite, &forced), Err(Rejection::NotComposable));
}

#[test]
fn overlay_capabilities() {
    let f = fixture(PlaneInventory::default());
    let caps = PlaneCapabilities::new(CapabilityLimits::default());
    let overlay = PlaneType::Overlay;

    let video = f.layer(PixelFormat::Nv12, 0, 0, 1280, 720);
    assert_eq!(caps.check(overlay, &video), Ok(()));
    // NV12 may rotate but not mirror
    assert_eq!(
        caps.check(overlay, &video.clone().with_transform(Transform::ROT_270)
            .with_frame(0, 0, 720, 1280)),
        Ok(())
    );
    assert_eq!(
        caps.check(overlay, &video.clone().with_transform(Transform::FLIP_H)),
        Err(Rejection::Transform)
    );
    // planar formats can't rotate at all
    let yv12 = f.layer(PixelFormat::Yv12, 0, 0, 640, 480);
    assert_eq!(
        caps.check(overlay, &yv12.with_transform(Transform::ROT_180)),
        Err(Rejection::Format)
    );
    assert_eq!(
        caps.check(overlay, &f.layer(PixelFormat::Rgba8888, 0, 0, 64, 64)),
        Err(Rejection::Format)
    );

    // packed YUV has the smaller stride limit
    assert_eq!(
        caps.check(overlay, &f.layer(PixelFormat::Yuy2, 0, 0, 2100, 16)),
        Err(Rejection::Size)
    );
    assert_eq!(
        caps.check(overlay, &video.clone().with_blending(Blending::Premultiplied)),
        Err(Rejection::Blending)
    );

    // scaling limits
    assert_eq!(
        caps.check(overlay, &video.clone().with_frame(0, 0, 160, 90)),
        Err(Rejection::Scaling)
    );
    assert_eq!(
        caps.check(overlay, &video.clone().with_frame(0, 0, 1, 720)),
        Err(Rejection::Scaling)
    );
    assert_eq!(
        caps.check(overlay, &video.clone().with_frame(0, 0, 1920, 1080)),
        Ok(())
    );
    assert_eq!(
        caps.check(overlay, &f.layer(PixelFormat::Nv12, 0, 0, 2048, 16)),
        Err(Rejection::Scaling)
    );

    // unaligned crops only work for protected content
    let mut cropped = video.with_crop(10.0, 0.0, 640.0, 720.0).with_frame(0, 0, 640, 720);
    assert_eq!(caps.check(overlay, &cropped), Err(Rejection::Scaling));
    cropped.l_usage |= BufferUsage::PROTECTED;
    assert_eq!(caps.check(overlay, &cropped), Ok(()));
}

#[test]
fn cursor_and_rgb_overlay_capabilities() {
    let f = fixture(PlaneInventory::default());
    let caps = PlaneCapabilities::new(CapabilityLimits::default());

    let cursor = f
        .layer(PixelFormat::Rgba8888, 0, 0, 64, 64)
        .with_flags(LayerFlags::IS_CURSOR_LAYER);
    assert_eq!(caps.check_cursor(&cursor, 2, 3), Ok(()));
    assert_eq!(caps.check_cursor(&cursor, 1, 3), Err(Rejection::NotTopmost));
    let big = f
        .layer(PixelFormat::Rgba8888, 0, 0, 512, 512)
        .with_flags(LayerFlags::IS_CURSOR_LAYER);
    assert_eq!(caps.check_cursor(&big, 0, 1), Err(Rejection::Size));
    let plain = f.layer(PixelFormat::Rgba8888, 0, 0, 64, 64);
    assert_eq!(caps.check_cursor(&plain, 0, 1), Err(Rejection::NotComposable));

    let opaque = f.layer(PixelFormat::Bgrx8888, 0, 0, 800, 600);
    assert_eq!(caps.check_rgb_overlay(&opaque), Ok(()));
    assert_eq!(
        caps.check_rgb_overlay(&opaque.clone().with_blending(Blending::Coverage)),
        Err(Rejection::Blending)
    );
    assert_eq!(
        caps.check_rgb_overlay(&f.layer(PixelFormat::Rgbx8888, 0, 0, 800, 600)),
        Err(Rejection::Format)
    );
    assert_eq!(
        caps.check_rgb_overlay(&f.layer(PixelFormat::Bgra8888, 0, 0, 1100, 10)),
        Err(Rejection::Size)
    );
}

#[test]
fn unmappable_layer_alone_goes_to_the_gpu() {
    let mut f = fixture(PlaneInventory::default());
    let left = f.layer(PixelFormat::Rgba8888, 0, 0, 400, 300);
    let right = f.layer(PixelFormat::Rgba8888, 800, 0, 400, 300);
    let bad = right.l_handle;
    let mut contents = DisplayContents::new(vec![left, right, f.target()]);

    f.backend.fail_map(bad, true);
    let result = f
        .comp
        .prepare(&mut contents, &mut f.planes, &f.bm, f.primary);
    assert_eq!(result, AssignResult::Success);
    assert!(!f.comp.is_frame_fallback());
    assert_eq!(f.comp.excluded_layers(), &[1]);

    // the healthy layer keeps its plane
    let layers = &contents.dc_layers;
    assert_eq!(layers[0].l_assignment.a_type, CompositionType::Overlay);
    assert_eq!(
        layers[0].l_assignment.a_plane.map(|p| p.pr_type),
        Some(PlaneType::Sprite)
    );
    assert!(f.bm.is_mapped(layers[0].l_handle));
    assert_eq!(layers[1].l_assignment.a_type, CompositionType::Framebuffer);
    assert_eq!(layers[1].l_assignment.a_plane, None);
    assert_eq!(layers[2].l_assignment.a_type, CompositionType::FramebufferTarget);
    assert_eq!(layers[2].l_assignment.a_plane, f.primary);
    assert!(!f.bm.is_mapped(bad));
    assert_exclusive(layers);

    // same geometry, the mapping works again
    f.backend.fail_map(bad, false);
    contents.dc_flags = ContentsFlags::empty();
    f.comp
        .prepare(&mut contents, &mut f.planes, &f.bm, f.primary);
    assert!(f.comp.excluded_layers().is_empty());
    assert_eq!(
        contents.dc_layers[1].l_assignment.a_plane.map(|p| p.pr_type),
        Some(PlaneType::Sprite)
    );
    assert!(f.bm.is_mapped(bad));
    assert_eq!(contents.gpu_layer_count(), 0);
    assert_exclusive(&contents.dc_layers);

    let mut dump = String::new();
    f.comp.dump(&mut dump);
    assert!(dump.contains("Overlay"));
}

#[test]
fn unmappable_video_frees_its_overlay() {
    let mut f = fixture(PlaneInventory::default());
    let video = f.layer(PixelFormat::Nv12, 0, 0, 1280, 720);
    let handle = video.l_handle;
    let mut contents = DisplayContents::new(vec![video, f.target()]);

    f.backend.fail_map(handle, true);
    f.comp
        .prepare(&mut contents, &mut f.planes, &f.bm, f.primary);
    assert_eq!(
        contents.dc_layers[0].l_assignment.a_type,
        CompositionType::Framebuffer
    );
    assert_eq!(contents.dc_layers[1].l_assignment.a_plane, f.primary);
    assert_eq!(f.planes.free_count(0, PlaneType::Overlay), 2);
    assert!(!f.bm.is_mapped(handle));
}
