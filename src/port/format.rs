//! Port formats and the configuration surface used to negotiate them

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{HEIGHT_ALIGN, WIDTH_ALIGN};
use crate::error::ConfigError;

/// Pack a four character code into its little-endian integer form
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Elementary stream encoding, identified by FourCC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Encoding(u32);

impl Encoding {
    pub const UNKNOWN: Self = Self(0);
    pub const I420: Self = Self(fourcc(b"I420"));
    pub const YV12: Self = Self(fourcc(b"YV12"));
    pub const NV12: Self = Self(fourcc(b"NV12"));
    pub const RGB24: Self = Self(fourcc(b"RGB3"));
    pub const BGR24: Self = Self(fourcc(b"BGR3"));
    pub const RGBA: Self = Self(fourcc(b"RGBA"));
    pub const OPAQUE: Self = Self(fourcc(b"OPQV"));
    pub const H264: Self = Self(fourcc(b"H264"));
    pub const MJPEG: Self = Self(fourcc(b"MJPG"));
    pub const JPEG: Self = Self(fourcc(b"JPEG"));
    pub const PNG: Self = Self(fourcc(b"PNG "));
    pub const GIF: Self = Self(fourcc(b"GIF "));
    pub const BMP: Self = Self(fourcc(b"BMP "));

    pub const fn from_fourcc(code: u32) -> Self {
        Self(code)
    }

    pub const fn fourcc(self) -> u32 {
        self.0
    }

    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// Compressed encodings carry variable-length payloads
    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            Self::H264 | Self::MJPEG | Self::JPEG | Self::PNG | Self::GIF | Self::BMP
        )
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return f.write_str("UNKNOWN");
        }
        let bytes = self.0.to_le_bytes();
        f.write_str(String::from_utf8_lossy(&bytes).trim_end())
    }
}

impl FromStr for Encoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("unknown") {
            return Ok(Self::UNKNOWN);
        }
        if s.is_empty() || s.len() > 4 || !s.is_ascii() {
            return Err(ConfigError::InvalidEncoding(s.to_string()));
        }
        let mut code = [b' '; 4];
        code[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(fourcc(&code)))
    }
}

impl TryFrom<String> for Encoding {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Encoding> for String {
    fn from(value: Encoding) -> Self {
        value.to_string()
    }
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Align to the hardware's 32x16 block size
    ///
    /// Dimensions too close to `u32::MAX` to round up are clamped to the
    /// largest aligned value below them.
    pub fn pad(self) -> Self {
        Self {
            width: align_up(self.width, WIDTH_ALIGN).unwrap_or(u32::MAX / WIDTH_ALIGN * WIDTH_ALIGN),
            height: align_up(self.height, HEIGHT_ALIGN).unwrap_or(u32::MAX / HEIGHT_ALIGN * HEIGHT_ALIGN),
        }
    }

    /// Align to the block size, or None if a dimension would overflow
    pub fn try_pad(self) -> Option<Self> {
        Some(Self {
            width: align_up(self.width, WIDTH_ALIGN)?,
            height: align_up(self.height, HEIGHT_ALIGN)?,
        })
    }

    pub fn is_zero(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

fn align_up(value: u32, align: u32) -> Option<u32> {
    value.checked_next_multiple_of(align)
}

/// Visible region inside a (padded) frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Crop {
    /// Crop covering the whole unpadded resolution
    pub fn full(resolution: Resolution) -> Self {
        Self {
            x: 0,
            y: 0,
            width: resolution.width,
            height: resolution.height,
        }
    }
}

/// Frame rate as a rational number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

/// Negotiated format of a port
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PortFormat {
    pub encoding: Encoding,
    pub resolution: Resolution,
    pub crop: Crop,
    pub framerate: Rational,
    pub bitrate: u32,
    /// Buffer count agreed with the hardware on commit
    pub buffer_num: usize,
    /// Buffer size agreed with the hardware on commit
    pub buffer_size: usize,
    pub zero_copy: bool,
}

impl PortFormat {
    pub fn new(encoding: Encoding, resolution: Resolution) -> Self {
        Self {
            encoding,
            resolution: resolution.pad(),
            crop: Crop::full(resolution),
            ..Self::default()
        }
    }

    /// Whether data in `self` can flow into a port negotiated as `other`
    pub fn is_compatible_with(&self, other: &PortFormat) -> bool {
        let encoding_ok = self.encoding.is_unknown()
            || other.encoding.is_unknown()
            || self.encoding == other.encoding;
        let resolution_ok = self.resolution.is_zero()
            || other.resolution.is_zero()
            || self.resolution == other.resolution;
        encoding_ok && resolution_ok
    }
}

impl fmt::Display for PortFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} crop({}, {}, {}, {}) {}/{}fps",
            self.encoding,
            self.resolution,
            self.crop.x,
            self.crop.y,
            self.crop.width,
            self.crop.height,
            self.framerate.num,
            self.framerate.den
        )
    }
}

/// Per-port negotiation parameters
///
/// Every field is optional; absent fields keep the port's current value or
/// fall back to what the hardware recommends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub encoding: Option<Encoding>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<i32>,
    pub bitrate: Option<u32>,
    pub buffer_num: Option<usize>,
    pub buffer_size: Option<usize>,
    pub zero_copy: bool,
}

impl PortConfig {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding: Some(encoding),
            ..Self::default()
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_buffers(mut self, num: usize, size: usize) -> Self {
        self.buffer_num = Some(num);
        self.buffer_size = Some(size);
        self
    }

    pub fn with_framerate(mut self, fps: i32) -> Self {
        self.framerate = Some(fps);
        self
    }

    pub fn with_zero_copy(mut self, zero_copy: bool) -> Self {
        self.zero_copy = zero_copy;
        self
    }

    /// Reject dimensions that cannot be padded to the block size
    pub fn validate(&self) -> Result<(), ConfigError> {
        let requested = Resolution::new(self.width.unwrap_or(0), self.height.unwrap_or(0));
        match requested.try_pad() {
            Some(_) => Ok(()),
            None => Err(ConfigError::InvalidResolution {
                width: requested.width,
                height: requested.height,
            }),
        }
    }

    /// Overlay this configuration onto `base`
    pub fn apply_to(&self, base: &PortFormat) -> Result<PortFormat, ConfigError> {
        let mut format = base.clone();
        if let Some(encoding) = self.encoding {
            format.encoding = encoding;
        }
        if self.width.is_some() || self.height.is_some() {
            let requested = Resolution::new(
                self.width.unwrap_or(base.crop.width),
                self.height.unwrap_or(base.crop.height),
            );
            format.resolution = requested.try_pad().ok_or(ConfigError::InvalidResolution {
                width: requested.width,
                height: requested.height,
            })?;
            format.crop = Crop::full(requested);
        }
        if let Some(fps) = self.framerate {
            format.framerate = Rational::new(fps, 1);
        }
        if let Some(bitrate) = self.bitrate {
            format.bitrate = bitrate;
        }
        format.zero_copy = self.zero_copy;
        Ok(format)
    }
}
