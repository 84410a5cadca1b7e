//! Pixel formats and e-paper waveforms

/// Refresh waveform requested for a repaint.
///
/// Trades refresh speed against quality. The numbering matches the values the
/// EPDC driver expects in `mxcfb_update_data::waveform_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum WaveformMode {
    /// Full clear through white, slowest
    Initialize = 0,
    /// Black and white only, fastest
    Mono = 1,
    HighQualityGrayscale = 2,
    Grayscale = 3,
    Highlight = 8,
}

impl WaveformMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Initialize),
            1 => Some(Self::Mono),
            2 => Some(Self::HighQualityGrayscale),
            3 => Some(Self::Grayscale),
            8 => Some(Self::Highlight),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Whether this waveform refreshes the whole panel rather than only the
    /// changed region
    pub fn is_full(self) -> bool {
        matches!(self, Self::Initialize | Self::HighQualityGrayscale)
    }
}

/// Pixel layout of a buffer.
///
/// Numbered to match the image formats of the toolkit most clients are
/// written with, so clients can pass their native format value through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PixelFormat {
    Invalid = 0,
    Mono = 1,
    MonoLsb = 2,
    Indexed8 = 3,
    Rgb32 = 4,
    Argb32 = 5,
    Argb32Premultiplied = 6,
    Rgb16 = 7,
    Argb8565Premultiplied = 8,
    Rgb666 = 9,
    Argb6666Premultiplied = 10,
    Rgb555 = 11,
    Argb8555Premultiplied = 12,
    Rgb888 = 13,
    Rgb444 = 14,
    Argb4444Premultiplied = 15,
    Rgbx8888 = 16,
    Rgba8888 = 17,
    Rgba8888Premultiplied = 18,
    Bgr30 = 19,
    A2Bgr30Premultiplied = 20,
    Rgb30 = 21,
    A2Rgb30Premultiplied = 22,
    Alpha8 = 23,
    Grayscale8 = 24,
    Rgbx64 = 25,
    Rgba64 = 26,
    Rgba64Premultiplied = 27,
    Grayscale16 = 28,
    Bgr888 = 29,
}

impl PixelFormat {
    const ALL: [PixelFormat; 30] = [
        Self::Invalid,
        Self::Mono,
        Self::MonoLsb,
        Self::Indexed8,
        Self::Rgb32,
        Self::Argb32,
        Self::Argb32Premultiplied,
        Self::Rgb16,
        Self::Argb8565Premultiplied,
        Self::Rgb666,
        Self::Argb6666Premultiplied,
        Self::Rgb555,
        Self::Argb8555Premultiplied,
        Self::Rgb888,
        Self::Rgb444,
        Self::Argb4444Premultiplied,
        Self::Rgbx8888,
        Self::Rgba8888,
        Self::Rgba8888Premultiplied,
        Self::Bgr30,
        Self::A2Bgr30Premultiplied,
        Self::Rgb30,
        Self::A2Rgb30Premultiplied,
        Self::Alpha8,
        Self::Grayscale8,
        Self::Rgbx64,
        Self::Rgba64,
        Self::Rgba64Premultiplied,
        Self::Grayscale16,
        Self::Bgr888,
    ];

    pub fn from_raw(raw: i32) -> Option<Self> {
        usize::try_from(raw).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Bytes per pixel, `None` for bit-packed or invalid formats
    pub fn bytes_per_pixel(self) -> Option<usize> {
        use PixelFormat::*;
        match self {
            Invalid | Mono | MonoLsb => None,
            Indexed8 | Alpha8 | Grayscale8 => Some(1),
            Rgb16 | Rgb555 | Rgb444 | Argb4444Premultiplied | Grayscale16 => Some(2),
            Rgb888 | Bgr888 | Rgb666 | Argb8565Premultiplied | Argb6666Premultiplied
            | Argb8555Premultiplied => Some(3),
            Rgb32 | Argb32 | Argb32Premultiplied | Rgbx8888 | Rgba8888
            | Rgba8888Premultiplied | Bgr30 | A2Bgr30Premultiplied | Rgb30
            | A2Rgb30Premultiplied => Some(4),
            Rgbx64 | Rgba64 | Rgba64Premultiplied => Some(8),
        }
    }

    /// Whether [`PixelFormat::to_rgb`] and [`PixelFormat::write_rgb`] handle
    /// this format
    pub fn can_convert(self) -> bool {
        use PixelFormat::*;
        matches!(
            self,
            Grayscale8
                | Grayscale16
                | Rgb16
                | Rgb32
                | Argb32
                | Argb32Premultiplied
                | Rgbx8888
                | Rgba8888
                | Rgba8888Premultiplied
                | Rgb888
                | Bgr888
        )
    }

    /// Decode one pixel to 8-bit RGB. Returns `None` for formats the
    /// compositor cannot convert.
    pub fn to_rgb(self, px: &[u8]) -> Option<[u8; 3]> {
        use PixelFormat::*;
        let rgb = match self {
            Grayscale8 => [px[0]; 3],
            Grayscale16 => {
                let v = (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8;
                [v; 3]
            }
            Rgb16 => {
                let v = u16::from_le_bytes([px[0], px[1]]);
                let r = ((v >> 11) & 0x1f) as u8;
                let g = ((v >> 5) & 0x3f) as u8;
                let b = (v & 0x1f) as u8;
                [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
            }
            // 0xAARRGGBB stored little-endian
            Rgb32 | Argb32 | Argb32Premultiplied => [px[2], px[1], px[0]],
            Rgbx8888 | Rgba8888 | Rgba8888Premultiplied | Rgb888 => [px[0], px[1], px[2]],
            Bgr888 => [px[2], px[1], px[0]],
            _ => return None,
        };
        Some(rgb)
    }

    /// Encode one 8-bit RGB pixel into `out`. Returns `false` for formats the
    /// compositor cannot convert.
    pub fn write_rgb(self, rgb: [u8; 3], out: &mut [u8]) -> bool {
        use PixelFormat::*;
        let [r, g, b] = rgb;
        match self {
            Grayscale8 => out[0] = gray(rgb),
            Grayscale16 => {
                let v = u16::from(gray(rgb)) * 0x0101;
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            Rgb16 => {
                let v = (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3);
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            Rgb32 | Argb32 | Argb32Premultiplied => out[..4].copy_from_slice(&[b, g, r, 0xff]),
            Rgbx8888 | Rgba8888 | Rgba8888Premultiplied => {
                out[..4].copy_from_slice(&[r, g, b, 0xff])
            }
            Rgb888 => out[..3].copy_from_slice(&[r, g, b]),
            Bgr888 => out[..3].copy_from_slice(&[b, g, r]),
            _ => return false,
        }
        true
    }
}

/// Luminance with the usual 11/16/5 weighting
fn gray([r, g, b]: [u8; 3]) -> u8 {
    ((u32::from(r) * 11 + u32::from(g) * 16 + u32::from(b) * 5) / 32) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_numbering() {
        assert_eq!(PixelFormat::from_raw(7), Some(PixelFormat::Rgb16));
        assert_eq!(PixelFormat::from_raw(24), Some(PixelFormat::Grayscale8));
        assert_eq!(PixelFormat::from_raw(29), Some(PixelFormat::Bgr888));
        assert_eq!(PixelFormat::from_raw(30), None);
        assert_eq!(PixelFormat::from_raw(-1), None);
        for (i, format) in PixelFormat::ALL.iter().enumerate() {
            assert_eq!(format.as_raw(), i as i32);
        }
    }

    #[test]
    fn test_rgb16_white_and_black() {
        let mut px = [0u8; 2];
        assert!(PixelFormat::Rgb16.write_rgb([255, 255, 255], &mut px));
        assert_eq!(px, [0xff, 0xff]);
        assert_eq!(PixelFormat::Rgb16.to_rgb(&px), Some([255, 255, 255]));
        assert!(PixelFormat::Rgb16.write_rgb([0, 0, 0], &mut px));
        assert_eq!(PixelFormat::Rgb16.to_rgb(&px), Some([0, 0, 0]));
    }

    #[test]
    fn test_rgb32_to_grayscale() {
        let px = [0x00, 0x00, 0xff, 0xff]; // opaque red
        let rgb = PixelFormat::Rgb32.to_rgb(&px).unwrap();
        assert_eq!(rgb, [255, 0, 0]);
        let mut out = [0u8; 1];
        assert!(PixelFormat::Grayscale8.write_rgb(rgb, &mut out));
        assert_eq!(out[0], (255 * 11 / 32) as u8);
    }

    #[test]
    fn test_unconvertible_formats() {
        assert_eq!(PixelFormat::Mono.to_rgb(&[0]), None);
        assert!(!PixelFormat::Indexed8.write_rgb([0, 0, 0], &mut [0]));
        assert_eq!(PixelFormat::Mono.bytes_per_pixel(), None);
        assert!(!PixelFormat::Rgb30.can_convert());
        assert!(PixelFormat::Bgr888.can_convert());
    }

    #[test]
    fn test_waveform_values() {
        assert_eq!(WaveformMode::from_raw(1), Some(WaveformMode::Mono));
        assert_eq!(WaveformMode::from_raw(8), Some(WaveformMode::Highlight));
        assert_eq!(WaveformMode::from_raw(4), None);
        assert!(WaveformMode::HighQualityGrayscale.is_full());
        assert!(!WaveformMode::Mono.is_full());
    }
}
