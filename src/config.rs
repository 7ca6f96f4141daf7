// Hardware composer configuration
//
// Loaded from TOML. Every table is optional and missing fields fall
// back to the values of the stock plane hardware.
use serde::{Deserialize, Serialize};
use std::path::Path;
use utils::{anyhow, Context, Result};

/// The plane bitmasks are 32 bits wide
pub const MAX_PLANES_PER_TYPE: usize = 32;

/// How many planes of each class the display engine has
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneInventory {
    pub primary: usize,
    pub sprite: usize,
    pub overlay: usize,
    pub cursor: usize,
    /// Most planes a single display can blend in one frame
    pub max_per_display: usize,
}

impl Default for PlaneInventory {
    fn default() -> Self {
        Self {
            primary: 3,
            sprite: 3,
            overlay: 2,
            cursor: 3,
            max_per_display: 5,
        }
    }
}

/// Limits used by the plane capability checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityLimits {
    /// Largest stride in bytes a sprite or primary plane can fetch
    pub sprite_max_stride: u32,
    /// Stride limit of the overlay for YUY2/UYVY
    pub overlay_max_stride_packed: u32,
    /// Stride limit of the overlay for planar YUV
    pub overlay_max_stride_linear: u32,
    pub overlay_max_src_width: u32,
    pub overlay_max_src_height: u32,
    pub overlay_min_scale: f32,
    pub overlay_max_scale: f32,
    /// Source crop origin alignment the overlay needs for unprotected content
    pub overlay_crop_alignment: u32,
    pub rgb_overlay_max_stride: u32,
    pub cursor_max_size: u32,
}

impl Default for CapabilityLimits {
    fn default() -> Self {
        Self {
            sprite_max_stride: 16384,
            overlay_max_stride_packed: 4096,
            overlay_max_stride_linear: 8192,
            overlay_max_src_width: 2047,
            overlay_max_src_height: 2047,
            overlay_min_scale: 0.25,
            overlay_max_scale: 4.0,
            overlay_crop_alignment: 64,
            rgb_overlay_max_stride: 4096,
            cursor_max_size: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VsyncSettings {
    /// Refresh rate assumed when a display does not report one
    pub default_refresh: u32,
    /// Ignore hardware vsync events and generate them in software
    pub force_software: bool,
}

impl Default for VsyncSettings {
    fn default() -> Self {
        Self {
            default_refresh: 60,
            force_software: false,
        }
    }
}

/// The flavors of display device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Built in panel, always present
    Primary,
    /// Hotpluggable output
    External,
    /// Placeholder display with no hardware behind it
    Dummy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HwcConfig {
    pub planes: PlaneInventory,
    pub limits: CapabilityLimits,
    pub vsync: VsyncSettings,
    /// One entry per display, the index is the display id
    pub displays: Vec<DeviceKind>,
}

impl Default for HwcConfig {
    fn default() -> Self {
        Self {
            planes: PlaneInventory::default(),
            limits: CapabilityLimits::default(),
            vsync: VsyncSettings::default(),
            displays: vec![DeviceKind::Primary, DeviceKind::External],
        }
    }
}

impl HwcConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: HwcConfig =
            toml::from_str(contents).context("Could not parse composer config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read composer config {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid composer config {}", path.display()))
    }

    /// Check that the plane inventory can back the display list
    pub fn validate(&self) -> Result<()> {
        let p = &self.planes;
        for (name, count) in [
            ("primary", p.primary),
            ("sprite", p.sprite),
            ("overlay", p.overlay),
            ("cursor", p.cursor),
        ] {
            if count > MAX_PLANES_PER_TYPE {
                return Err(anyhow!(
                    "{} {} planes configured, at most {} are supported",
                    count,
                    name,
                    MAX_PLANES_PER_TYPE
                ));
            }
        }

        if p.max_per_display == 0 {
            return Err(anyhow!("planes.max_per_display must be at least 1"));
        }
        if self.displays.is_empty() {
            return Err(anyhow!("At least one display must be configured"));
        }
        if self.displays[0] != DeviceKind::Primary {
            return Err(anyhow!("Display 0 must be the primary display"));
        }
        if self.vsync.default_refresh == 0 {
            return Err(anyhow!("vsync.default_refresh must be non-zero"));
        }

        Ok(())
    }
}
