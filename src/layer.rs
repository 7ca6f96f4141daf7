// Layers handed to us by the display server
//
use crate::buffer::DataBuffer;
use crate::plane::PlaneRef;
use crate::sync::Fence;
use utils::region::Rect;

/// Opaque identity of a graphics buffer. Zero means no buffer.
pub type BufferHandle = u64;

/// Pixel layouts the planes know about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8888,
    Rgbx8888,
    Bgra8888,
    Bgrx8888,
    Rgb565,
    Yv12,
    I420,
    Nv12,
    /// NV12 in the display engine's tiled layout
    Nv12Tiled,
    Yuy2,
    Uyvy,
}

impl PixelFormat {
    pub fn is_rgb(self) -> bool {
        matches!(
            self,
            PixelFormat::Rgba8888
                | PixelFormat::Rgbx8888
                | PixelFormat::Bgra8888
                | PixelFormat::Bgrx8888
                | PixelFormat::Rgb565
        )
    }

    pub fn is_yuv(self) -> bool {
        !self.is_rgb()
    }

    /// Single plane YUV 4:2:2 formats
    pub fn is_yuv_packed(self) -> bool {
        matches!(self, PixelFormat::Yuy2 | PixelFormat::Uyvy)
    }

    /// Bytes per pixel of the first (or only) plane
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8888
            | PixelFormat::Rgbx8888
            | PixelFormat::Bgra8888
            | PixelFormat::Bgrx8888 => 4,
            PixelFormat::Rgb565 | PixelFormat::Yuy2 | PixelFormat::Uyvy => 2,
            PixelFormat::Yv12 | PixelFormat::I420 | PixelFormat::Nv12 | PixelFormat::Nv12Tiled => 1,
        }
    }
}

bitflags! {
    /// Layer transform, applied flips first and then the 90 degree rotation
    #[derive(Default)]
    pub struct Transform: u32 {
        const FLIP_H = 0x01;
        const FLIP_V = 0x02;
        const ROT_90 = 0x04;
        const ROT_180 = Self::FLIP_H.bits | Self::FLIP_V.bits;
        const ROT_270 = Self::ROT_180.bits | Self::ROT_90.bits;
    }
}

bitflags! {
    /// How a buffer was allocated
    #[derive(Default)]
    pub struct BufferUsage: u32 {
        /// Scanout by a composer plane is allowed
        const HW_COMPOSER = 0x01;
        /// Content must only travel through protected paths
        const PROTECTED = 0x02;
        /// Frame buffer allocation
        const HW_FB = 0x04;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct LayerFlags: u32 {
        /// The server will draw this layer itself, leave it alone
        const SKIP_LAYER = 0x01;
        const IS_CURSOR_LAYER = 0x02;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct ContentsFlags: u32 {
        /// Layers were added, removed or moved since the last frame
        const GEOMETRY_CHANGED = 0x01;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blending {
    None,
    Premultiplied,
    Coverage,
}

/// What the server wants done with a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionHint {
    /// Let the composer decide
    Device,
    /// Always draw this one with the GPU
    ForceClient,
    /// The buffer the GPU composes everything else into
    FramebufferTarget,
    /// Content is streamed by another component, never composited here
    Sideband,
}

/// The path a layer takes this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionType {
    /// The GPU draws it into the framebuffer target
    Framebuffer,
    /// Scanned out by a plane
    Overlay,
    /// Scanned out by a cursor plane
    CursorOverlay,
    FramebufferTarget,
    Sideband,
}

/// Result of plane assignment, written back into each layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub a_type: CompositionType,
    pub a_plane: Option<PlaneRef>,
}

impl Assignment {
    pub fn gpu() -> Self {
        Self {
            a_type: CompositionType::Framebuffer,
            a_plane: None,
        }
    }
}

/// One compositing surface for one frame
///
/// The server owns this for the duration of a prepare/commit cycle.
/// Only `l_assignment` and `l_release_fence` are written by us.
#[derive(Debug, Clone)]
pub struct Layer {
    pub l_handle: BufferHandle,
    pub l_format: PixelFormat,
    pub l_width: u32,
    pub l_height: u32,
    /// Row pitch in bytes
    pub l_stride: u32,
    pub l_usage: BufferUsage,
    /// The region of the buffer to show
    pub l_crop: Rect<f32>,
    /// Where on the display it goes
    pub l_frame: Rect<i32>,
    pub l_transform: Transform,
    pub l_blending: Blending,
    pub l_plane_alpha: u8,
    pub l_flags: LayerFlags,
    pub l_hint: CompositionHint,
    pub l_assignment: Assignment,
    /// Signaled once the hardware no longer reads this layer's buffer
    pub l_release_fence: Option<Fence>,
}

impl Layer {
    /// A full size, untransformed layer showing `handle`
    pub fn new(handle: BufferHandle, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            l_handle: handle,
            l_format: format,
            l_width: width,
            l_height: height,
            l_stride: width * format.bytes_per_pixel(),
            l_usage: BufferUsage::HW_COMPOSER,
            l_crop: Rect::new(0.0, 0.0, width as f32, height as f32),
            l_frame: Rect::new(0, 0, width as i32, height as i32),
            l_transform: Transform::empty(),
            l_blending: Blending::None,
            l_plane_alpha: 0xff,
            l_flags: LayerFlags::empty(),
            l_hint: CompositionHint::Device,
            l_assignment: Assignment::gpu(),
            l_release_fence: None,
        }
    }

    /// A layer taking its attributes from the buffer's metadata
    pub fn from_buffer(buffer: &DataBuffer) -> Self {
        let mut layer = Self::new(
            buffer.db_handle,
            buffer.db_format,
            buffer.db_width,
            buffer.db_height,
        );
        layer.l_stride = buffer.db_stride;
        layer.l_usage = buffer.db_usage;
        layer
    }

    /// The framebuffer target for a display. Must be the last layer.
    pub fn framebuffer_target(buffer: &DataBuffer) -> Self {
        let mut layer = Self::from_buffer(buffer);
        layer.l_blending = Blending::Premultiplied;
        layer.l_hint = CompositionHint::FramebufferTarget;
        layer.l_assignment.a_type = CompositionType::FramebufferTarget;
        layer
    }

    pub fn with_frame(mut self, x: i32, y: i32, width: i32, height: i32) -> Self {
        self.l_frame = Rect::new(x, y, width, height);
        self
    }

    pub fn with_crop(mut self, x: f32, y: f32, width: f32, height: f32) -> Self {
        self.l_crop = Rect::new(x, y, width, height);
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.l_transform = transform;
        self
    }

    pub fn with_blending(mut self, blending: Blending) -> Self {
        self.l_blending = blending;
        self
    }

    pub fn with_flags(mut self, flags: LayerFlags) -> Self {
        self.l_flags = flags;
        self
    }

    pub fn with_hint(mut self, hint: CompositionHint) -> Self {
        self.l_hint = hint;
        self
    }

    pub fn is_protected(&self) -> bool {
        self.l_usage.contains(BufferUsage::PROTECTED)
    }

    /// Is this layer scanned out directly this frame
    pub fn is_on_plane(&self) -> bool {
        matches!(
            self.l_assignment.a_type,
            CompositionType::Overlay | CompositionType::CursorOverlay
        )
    }
}

/// Everything shown on one display for one frame
#[derive(Debug, Clone)]
pub struct DisplayContents {
    pub dc_layers: Vec<Layer>,
    pub dc_flags: ContentsFlags,
    /// Signaled when this frame is replaced on screen
    pub dc_retire_fence: Option<Fence>,
}

impl DisplayContents {
    /// Contents for a new geometry
    pub fn new(layers: Vec<Layer>) -> Self {
        Self {
            dc_layers: layers,
            dc_flags: ContentsFlags::GEOMETRY_CHANGED,
            dc_retire_fence: None,
        }
    }

    /// Index of the framebuffer target, if the list ends with one
    pub fn target_index(&self) -> Option<usize> {
        match self.dc_layers.last() {
            Some(l) if l.l_hint == CompositionHint::FramebufferTarget => {
                Some(self.dc_layers.len() - 1)
            }
            _ => None,
        }
    }

    /// Mark every layer as drawn by the GPU
    pub fn force_gpu(&mut self) {
        for layer in self.dc_layers.iter_mut() {
            layer.l_assignment = match layer.l_hint {
                CompositionHint::FramebufferTarget => Assignment {
                    a_type: CompositionType::FramebufferTarget,
                    a_plane: None,
                },
                CompositionHint::Sideband => Assignment {
                    a_type: CompositionType::Sideband,
                    a_plane: None,
                },
                _ => Assignment::gpu(),
            };
        }
    }

    /// Number of layers the GPU has to draw this frame
    pub fn gpu_layer_count(&self) -> usize {
        self.dc_layers
            .iter()
            .filter(|l| l.l_assignment.a_type == CompositionType::Framebuffer)
            .count()
    }
}
