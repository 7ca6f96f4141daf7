// What each plane class can scan out
//
// The checks run in a fixed order and stop at the first failure, which
// is reported so the trace log says why a layer stayed on the GPU.
use crate::config::CapabilityLimits;
use crate::layer::{
    Blending, BufferUsage, CompositionHint, Layer, LayerFlags, PixelFormat, Transform,
};
use crate::plane::PlaneType;
use utils::log;

use std::fmt;
use std::result::Result as StdResult;

/// The first capability check a layer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Forced to the GPU, skipped, without a buffer or not composer usage
    NotComposable,
    Format,
    /// Stride or dimensions out of range
    Size,
    Blending,
    Scaling,
    Transform,
    /// Cursor layer that is not directly below the framebuffer target
    NotTopmost,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rejection::NotComposable => "not composable",
            Rejection::Format => "bad buffer format",
            Rejection::Size => "bad buffer size",
            Rejection::Blending => "bad blending",
            Rejection::Scaling => "bad scaling",
            Rejection::Transform => "bad transform",
            Rejection::NotTopmost => "cursor is not on top",
        };
        write!(f, "{}", s)
    }
}

/// Source width and height, truncating each edge like the hardware does
fn source_size(layer: &Layer) -> (i32, i32) {
    let crop = &layer.l_crop;
    (
        crop.right() as i32 - crop.left() as i32,
        crop.bottom() as i32 - crop.top() as i32,
    )
}

fn is_unscaled(layer: &Layer) -> bool {
    let (src_w, src_h) = source_size(layer);
    src_w == layer.l_frame.width() && src_h == layer.l_frame.height()
}

pub struct PlaneCapabilities {
    pc_limits: CapabilityLimits,
}

impl PlaneCapabilities {
    pub fn new(limits: CapabilityLimits) -> Self {
        Self { pc_limits: limits }
    }

    pub fn limits(&self) -> &CapabilityLimits {
        &self.pc_limits
    }

    /// Can this layer go on a plane at all
    fn is_composable(layer: &Layer) -> bool {
        if layer.l_hint != CompositionHint::Device {
            log::trace!("layer was forced to the GPU");
            return false;
        }
        if layer.l_flags.contains(LayerFlags::SKIP_LAYER) {
            log::trace!("skip layer flag was set");
            return false;
        }
        if layer.l_handle == 0 {
            log::trace!("invalid buffer handle");
            return false;
        }
        if !layer.l_usage.contains(BufferUsage::HW_COMPOSER) {
            log::trace!("not a composer layer");
            return false;
        }
        true
    }

    /// Run every check for one plane class
    pub fn check(&self, ty: PlaneType, layer: &Layer) -> StdResult<(), Rejection> {
        if !Self::is_composable(layer) {
            return Err(Rejection::NotComposable);
        }
        if !Self::is_format_supported(ty, layer) {
            return Err(Rejection::Format);
        }
        if !self.is_size_supported(ty, layer) {
            return Err(Rejection::Size);
        }
        if !Self::is_blending_supported(ty, layer) {
            return Err(Rejection::Blending);
        }
        if !self.is_scaling_supported(ty, layer) {
            return Err(Rejection::Scaling);
        }
        if !Self::is_transform_supported(ty, layer) {
            return Err(Rejection::Transform);
        }
        Ok(())
    }

    /// Can layer `index` of `count` non target layers use a cursor plane
    pub fn check_cursor(
        &self,
        layer: &Layer,
        index: usize,
        count: usize,
    ) -> StdResult<(), Rejection> {
        if !layer.l_flags.contains(LayerFlags::IS_CURSOR_LAYER) {
            return Err(Rejection::NotComposable);
        }
        if index + 1 != count {
            log::trace!("cursor layer {} is not on top of zorder", index);
            return Err(Rejection::NotTopmost);
        }
        self.check(PlaneType::Cursor, layer)
    }

    /// Can an opaque RGB layer take an overlay plane
    pub fn check_rgb_overlay(&self, layer: &Layer) -> StdResult<(), Rejection> {
        if !Self::is_composable(layer) {
            return Err(Rejection::NotComposable);
        }
        if !matches!(layer.l_format, PixelFormat::Bgra8888 | PixelFormat::Bgrx8888) {
            return Err(Rejection::Format);
        }
        if layer.l_stride > self.pc_limits.rgb_overlay_max_stride {
            return Err(Rejection::Size);
        }
        if layer.l_blending != Blending::None {
            return Err(Rejection::Blending);
        }
        if !is_unscaled(layer) {
            return Err(Rejection::Scaling);
        }
        if !layer.l_transform.is_empty() {
            return Err(Rejection::Transform);
        }
        Ok(())
    }

    pub fn is_format_supported(ty: PlaneType, layer: &Layer) -> bool {
        let transformed = !layer.l_transform.is_empty();
        match ty {
            PlaneType::Sprite | PlaneType::Primary => layer.l_format.is_rgb() && !transformed,
            PlaneType::Overlay => match layer.l_format {
                PixelFormat::Yv12 | PixelFormat::I420 | PixelFormat::Yuy2 | PixelFormat::Uyvy => {
                    !transformed
                }
                PixelFormat::Nv12 | PixelFormat::Nv12Tiled => true,
                _ => false,
            },
            PlaneType::Cursor => {
                matches!(layer.l_format, PixelFormat::Bgra8888 | PixelFormat::Rgba8888)
            }
        }
    }

    pub fn is_size_supported(&self, ty: PlaneType, layer: &Layer) -> bool {
        match ty {
            PlaneType::Sprite | PlaneType::Primary => {
                layer.l_stride <= self.pc_limits.sprite_max_stride
            }
            PlaneType::Overlay => {
                let max_stride = match layer.l_format.is_yuv_packed() {
                    true => self.pc_limits.overlay_max_stride_packed,
                    false => self.pc_limits.overlay_max_stride_linear,
                };
                layer.l_stride <= max_stride
            }
            PlaneType::Cursor => {
                let (w, h) = source_size(layer);
                let max = self.pc_limits.cursor_max_size as i32;
                w <= max && h <= max
            }
        }
    }

    pub fn is_blending_supported(ty: PlaneType, layer: &Layer) -> bool {
        match ty {
            PlaneType::Overlay => layer.l_blending == Blending::None,
            _ => true,
        }
    }

    pub fn is_scaling_supported(&self, ty: PlaneType, layer: &Layer) -> bool {
        match ty {
            PlaneType::Sprite | PlaneType::Primary => is_unscaled(layer),
            // cursor planes can not scale either, but the cursor size
            // check already bounds the source
            PlaneType::Cursor => true,
            PlaneType::Overlay => self.is_overlay_scaling_supported(layer),
        }
    }

    fn is_overlay_scaling_supported(&self, layer: &Layer) -> bool {
        let limits = &self.pc_limits;
        let (mut src_w, mut src_h) = source_size(layer);
        let (dst_w, dst_h) = (layer.l_frame.width(), layer.l_frame.height());

        if src_w > limits.overlay_max_src_width as i32
            || src_h > limits.overlay_max_src_height as i32
        {
            return false;
        }
        if dst_w <= 1 || dst_h <= 1 || src_w <= 1 || src_h <= 1 {
            log::trace!("invalid overlay size {}x{} => {}x{}", src_w, src_h, dst_w, dst_h);
            return false;
        }

        if layer.l_transform == Transform::ROT_90 || layer.l_transform == Transform::ROT_270 {
            std::mem::swap(&mut src_w, &mut src_h);
        }

        if !layer.is_protected() {
            let align = limits.overlay_crop_alignment.max(1) as i32;
            if layer.l_crop.left() as i32 % align != 0 {
                log::trace!("crop offset {} is not aligned", layer.l_crop.left());
                return false;
            }

            let scale_x = src_w as f32 / dst_w as f32;
            let scale_y = src_h as f32 / dst_h as f32;
            let range = limits.overlay_min_scale..=limits.overlay_max_scale;
            if !range.contains(&scale_x) || !range.contains(&scale_y) {
                log::trace!("overlay scale {}x{} out of range", scale_x, scale_y);
                return false;
            }
        }

        true
    }

    pub fn is_transform_supported(ty: PlaneType, layer: &Layer) -> bool {
        match ty {
            // no flips, only rotations
            PlaneType::Overlay => [
                Transform::empty(),
                Transform::ROT_90,
                Transform::ROT_180,
                Transform::ROT_270,
            ]
            .contains(&layer.l_transform),
            _ => layer.l_transform.is_empty(),
        }
    }
}
