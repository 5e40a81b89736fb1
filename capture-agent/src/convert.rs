// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Pixel quantization and HDR transfer encoding
//!
//! Turns a tightly packed backbuffer readback into one of the canonical
//! layouts in [`CanonicalFormat`]. All functions here are pure: they only
//! write into the destination the caller hands in, so they can run on any
//! thread.
//!
//! 16-bit channels are stored little-endian.

use log::warn;

use crate::protocol::{CanonicalFormat, PixelFormat};

/// Outcome of [`quantize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantization {
    /// `dst[..len]` holds the converted pixels
    Converted { len: usize },
    /// The source is already in the target layout, or the combination is
    /// not handled; use the source bytes as they are
    Passthrough,
}

/// Convert `src` (`width * height` pixels of `src_format`) into `target`.
///
/// `dst` only ever grows, so a buffer reused across captures stops
/// reallocating once it has seen the largest frame.
pub fn quantize(
    src: &[u8],
    src_format: PixelFormat,
    width: u32,
    height: u32,
    target: CanonicalFormat,
    dst: &mut Vec<u8>,
) -> Quantization {
    let pixels = width as usize * height as usize;

    if is_same_layout(src_format, target) {
        return Quantization::Passthrough;
    }

    if !is_supported(src_format, target) {
        warn!("Unsupported quantization {src_format:?} -> {target:?}, passing through");
        return Quantization::Passthrough;
    }

    if src.len() < pixels * src_format.bytes_per_pixel() {
        warn!(
            "Readback of {} bytes is too short for {width}x{height} {src_format:?}",
            src.len()
        );
        return Quantization::Passthrough;
    }

    let len = pixels * target.bytes_per_pixel();
    if dst.len() < len {
        dst.resize(len, 0);
    }
    let out = &mut dst[..len];

    match target {
        CanonicalFormat::Rgba8 => to_rgba8(src, src_format, out),
        CanonicalFormat::Rgb16Unorm => to_rgb16_unorm(src, src_format, out),
        CanonicalFormat::Rgb16Float => {
            for (s, d) in src.chunks_exact(8).zip(out.chunks_exact_mut(6)) {
                d.copy_from_slice(&s[..6]);
            }
        }
        CanonicalFormat::Rgb10a2 => {
            for (s, d) in src.chunks_exact(4).zip(out.chunks_exact_mut(4)) {
                let v = u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
                let swapped = ((v & 0x0000_03FF) << 20) | ((v & 0x3FF0_0000) >> 20) | (v & 0xC00F_FC00);
                d.copy_from_slice(&swapped.to_le_bytes());
            }
        }
    }

    Quantization::Converted { len }
}

fn is_supported(src: PixelFormat, target: CanonicalFormat) -> bool {
    match target {
        CanonicalFormat::Rgba8 => src != PixelFormat::Rgba16Float,
        CanonicalFormat::Rgb16Unorm => matches!(src, PixelFormat::Rgb10a2 | PixelFormat::Bgr10a2),
        CanonicalFormat::Rgb16Float => src == PixelFormat::Rgba16Float,
        CanonicalFormat::Rgb10a2 => src == PixelFormat::Bgr10a2,
    }
}

fn is_same_layout(src: PixelFormat, target: CanonicalFormat) -> bool {
    matches!(
        (src, target),
        (PixelFormat::Rgba8, CanonicalFormat::Rgba8) | (PixelFormat::Rgb10a2, CanonicalFormat::Rgb10a2)
    )
}

/// Offsets of the low, middle and high 10-bit fields in the output pixel
fn packed_offsets(format: PixelFormat) -> [usize; 3] {
    if format == PixelFormat::Bgr10a2 {
        [2, 1, 0]
    } else {
        [0, 1, 2]
    }
}

fn unpack_1010102(s: &[u8]) -> ([u32; 3], u32) {
    let v = u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
    (
        [v & 0x3FF, (v >> 10) & 0x3FF, (v >> 20) & 0x3FF],
        (v >> 30) & 0x3,
    )
}

fn to_rgba8(src: &[u8], format: PixelFormat, out: &mut [u8]) {
    match format {
        PixelFormat::R8 => {
            for (s, d) in src.iter().zip(out.chunks_exact_mut(4)) {
                d.copy_from_slice(&[*s, 0, 0, 0xFF]);
            }
        }
        PixelFormat::Rg8 => {
            for (s, d) in src.chunks_exact(2).zip(out.chunks_exact_mut(4)) {
                d.copy_from_slice(&[s[0], s[1], 0, 0xFF]);
            }
        }
        PixelFormat::Rgbx8 => {
            for (s, d) in src.chunks_exact(4).zip(out.chunks_exact_mut(4)) {
                d.copy_from_slice(&[s[0], s[1], s[2], 0xFF]);
            }
        }
        PixelFormat::Bgra8 => {
            for (s, d) in src.chunks_exact(4).zip(out.chunks_exact_mut(4)) {
                d.copy_from_slice(&[s[2], s[1], s[0], s[3]]);
            }
        }
        PixelFormat::Bgrx8 => {
            for (s, d) in src.chunks_exact(4).zip(out.chunks_exact_mut(4)) {
                d.copy_from_slice(&[s[2], s[1], s[0], 0xFF]);
            }
        }
        PixelFormat::Rgb10a2 | PixelFormat::Bgr10a2 => {
            let offsets = packed_offsets(format);
            for (s, d) in src.chunks_exact(4).zip(out.chunks_exact_mut(4)) {
                let (channels, alpha) = unpack_1010102(s);
                for (offset, value) in offsets.iter().zip(channels) {
                    d[*offset] = (value / 4) as u8;
                }
                d[3] = (alpha * 85) as u8;
            }
        }
        PixelFormat::Rgba8 => out.copy_from_slice(&src[..out.len()]),
        PixelFormat::Rgba16Float => {}
    }
}

fn to_rgb16_unorm(src: &[u8], format: PixelFormat, out: &mut [u8]) {
    let offsets = packed_offsets(format);
    for (s, d) in src.chunks_exact(4).zip(out.chunks_exact_mut(6)) {
        let (channels, _) = unpack_1010102(s);
        for (offset, value) in offsets.iter().zip(channels) {
            let wide = (value * 64) as u16;
            d[offset * 2..offset * 2 + 2].copy_from_slice(&wide.to_le_bytes());
        }
    }
}

/// Set every alpha byte of an RGBA8 buffer to fully opaque
pub fn force_opaque(rgba: &mut [u8]) {
    for pixel in rgba.chunks_exact_mut(4) {
        pixel[3] = 0xFF;
    }
}

// ============================================================================
// HDR
// ============================================================================

/// BT.709 to BT.2020 primaries, row major
const BT709_TO_BT2020: [[f32; 3]; 3] = [
    [0.627_403_9, 0.329_283_03, 0.043_313_067],
    [0.069_097_29, 0.919_540_4, 0.011_362_315],
    [0.016_391_44, 0.088_013_31, 0.895_595_25],
];

const PQ_M1: f32 = 0.159_301_757_812_5;
const PQ_M2: f32 = 78.843_75;
const PQ_C1: f32 = 0.835_937_5;
const PQ_C2: f32 = 18.851_562_5;
const PQ_C3: f32 = 18.6875;

/// scRGB 1.0 is 80 nits, PQ 1.0 is 10000 nits
const SCRGB_TO_PQ_SCALE: f32 = 1.0 / 125.0;

/// Decode an IEEE 754 binary16 value
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits & 0x8000) << 16;
    let exp = u32::from((bits >> 10) & 0x1F);
    let mant = u32::from(bits & 0x03FF);

    match exp {
        0 => {
            // Zero and subnormals: mant * 2^-24
            let magnitude = mant as f32 * (1.0 / 16_777_216.0);
            if sign == 0 { magnitude } else { -magnitude }
        }
        0x1F => f32::from_bits(sign | 0x7F80_0000 | (mant << 13)),
        _ => f32::from_bits(sign | ((exp + 112) << 23) | (mant << 13)),
    }
}

/// ST.2084 inverse EOTF for a normalized linear value. Out of range input
/// saturates, NaN encodes as black.
pub fn pq_encode(linear: f32) -> f32 {
    let linear = if linear.is_nan() { 0.0 } else { linear.clamp(0.0, 1.0) };
    let y = linear.powf(PQ_M1);
    ((PQ_C2 * y + PQ_C1) / (PQ_C3 * y + 1.0)).powf(PQ_M2)
}

/// Re-encode a half-float linear BT.709 RGB buffer (6 bytes per pixel) as
/// PQ BT.2020 16-bit unsigned RGB, in place.
pub fn encode_pq_in_place(rgb16f: &mut [u8]) {
    for pixel in rgb16f.chunks_exact_mut(6) {
        let rgb = [
            f16_to_f32(u16::from_le_bytes([pixel[0], pixel[1]])),
            f16_to_f32(u16::from_le_bytes([pixel[2], pixel[3]])),
            f16_to_f32(u16::from_le_bytes([pixel[4], pixel[5]])),
        ];

        for (channel, row) in BT709_TO_BT2020.iter().enumerate() {
            let wide = (row[0] * rgb[0] + row[1] * rgb[1] + row[2] * rgb[2]).max(0.0);
            let encoded = pq_encode(wide * SCRGB_TO_PQ_SCALE);
            let quantized = (encoded * 65536.0).round().clamp(0.0, 65535.0) as u16;
            pixel[channel * 2..channel * 2 + 2].copy_from_slice(&quantized.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const F16_ONE: u16 = 0x3C00;
    const F16_125: u16 = 0x57D0;
    const F16_NEG_ONE: u16 = 0xBC00;

    fn rgb16f_pixel(r: u16, g: u16, b: u16) -> Vec<u8> {
        [r, g, b].iter().flat_map(|c| c.to_le_bytes()).collect()
    }

    fn channel(buf: &[u8], index: usize) -> u16 {
        u16::from_le_bytes([buf[index * 2], buf[index * 2 + 1]])
    }

    #[test]
    fn test_bgra_to_rgba() {
        let src = [10, 20, 30, 40, 1, 2, 3, 4];
        let mut dst = Vec::new();

        let result = quantize(&src, PixelFormat::Bgra8, 2, 1, CanonicalFormat::Rgba8, &mut dst);

        assert_eq!(result, Quantization::Converted { len: 8 });
        assert_eq!(dst, vec![30, 20, 10, 40, 3, 2, 1, 4]);
    }

    #[test]
    fn test_padding_formats_force_alpha() {
        let mut dst = Vec::new();

        quantize(&[1, 2, 3, 0], PixelFormat::Bgrx8, 1, 1, CanonicalFormat::Rgba8, &mut dst);
        assert_eq!(&dst[..4], &[3, 2, 1, 0xFF]);

        quantize(&[1, 2, 3, 0], PixelFormat::Rgbx8, 1, 1, CanonicalFormat::Rgba8, &mut dst);
        assert_eq!(&dst[..4], &[1, 2, 3, 0xFF]);

        quantize(&[7, 8], PixelFormat::Rg8, 1, 1, CanonicalFormat::Rgba8, &mut dst);
        assert_eq!(&dst[..4], &[7, 8, 0, 0xFF]);

        quantize(&[9], PixelFormat::R8, 1, 1, CanonicalFormat::Rgba8, &mut dst);
        assert_eq!(&dst[..4], &[9, 0, 0, 0xFF]);
    }

    #[test]
    fn test_10bit_to_rgba8() {
        // low field 1023, middle 512, high 0, alpha 3
        let v: u32 = 1023 | (512 << 10) | (3 << 30);
        let mut dst = Vec::new();

        quantize(&v.to_le_bytes(), PixelFormat::Rgb10a2, 1, 1, CanonicalFormat::Rgba8, &mut dst);
        assert_eq!(&dst[..4], &[255, 128, 0, 255]);

        quantize(&v.to_le_bytes(), PixelFormat::Bgr10a2, 1, 1, CanonicalFormat::Rgba8, &mut dst);
        assert_eq!(&dst[..4], &[0, 128, 255, 255]);
    }

    #[test]
    fn test_10bit_to_rgb16() {
        let v: u32 = 1023 | (1 << 20);
        let mut dst = Vec::new();

        let result = quantize(&v.to_le_bytes(), PixelFormat::Bgr10a2, 1, 1, CanonicalFormat::Rgb16Unorm, &mut dst);

        assert_eq!(result, Quantization::Converted { len: 6 });
        assert_eq!(channel(&dst, 0), 64);
        assert_eq!(channel(&dst, 1), 0);
        assert_eq!(channel(&dst, 2), 1023 * 64);
    }

    #[test]
    fn test_bgr10_swizzle() {
        let v: u32 = 5 | (6 << 10) | (7 << 20) | (2 << 30);
        let mut dst = Vec::new();

        quantize(&v.to_le_bytes(), PixelFormat::Bgr10a2, 1, 1, CanonicalFormat::Rgb10a2, &mut dst);

        let out = u32::from_le_bytes([dst[0], dst[1], dst[2], dst[3]]);
        assert_eq!(out, 7 | (6 << 10) | (5 << 20) | (2 << 30));
    }

    #[test]
    fn test_half_float_drops_alpha() {
        let src: Vec<u8> = [1u16, 2, 3, 4].iter().flat_map(|c| c.to_le_bytes()).collect();
        let mut dst = Vec::new();

        quantize(&src, PixelFormat::Rgba16Float, 1, 1, CanonicalFormat::Rgb16Float, &mut dst);
        assert_eq!(&dst[..6], &src[..6]);
    }

    #[test]
    fn test_passthrough_cases() {
        let mut dst = Vec::new();

        assert_eq!(
            quantize(&[0; 4], PixelFormat::Rgba8, 1, 1, CanonicalFormat::Rgba8, &mut dst),
            Quantization::Passthrough
        );
        assert_eq!(
            quantize(&[0; 8], PixelFormat::Rgba16Float, 1, 1, CanonicalFormat::Rgba8, &mut dst),
            Quantization::Passthrough
        );
        // Short readback never panics
        assert_eq!(
            quantize(&[0; 3], PixelFormat::Bgra8, 1, 1, CanonicalFormat::Rgba8, &mut dst),
            Quantization::Passthrough
        );
        assert!(dst.is_empty());
    }

    #[test]
    fn test_destination_grows_only() {
        let mut dst = vec![0u8; 64];
        quantize(&[1, 2, 3, 4], PixelFormat::Bgra8, 1, 1, CanonicalFormat::Rgba8, &mut dst);
        assert_eq!(dst.len(), 64);
        assert_eq!(&dst[..4], &[3, 2, 1, 4]);
    }

    #[test]
    fn test_f16_decode() {
        assert_eq!(f16_to_f32(0), 0.0);
        assert_eq!(f16_to_f32(F16_ONE), 1.0);
        assert_eq!(f16_to_f32(F16_NEG_ONE), -1.0);
        assert_eq!(f16_to_f32(F16_125), 125.0);
        assert_eq!(f16_to_f32(0x0001), 1.0 / 16_777_216.0);
        assert!(f16_to_f32(0x7C00).is_infinite());
        assert!(f16_to_f32(0x7E00).is_nan());
    }

    #[test]
    fn test_pq_endpoints() {
        let mut black = rgb16f_pixel(0, 0, 0);
        encode_pq_in_place(&mut black);
        assert_eq!([channel(&black, 0), channel(&black, 1), channel(&black, 2)], [0, 0, 0]);

        // 10000 nits saturates
        let mut peak = rgb16f_pixel(F16_125, F16_125, F16_125);
        encode_pq_in_place(&mut peak);
        assert_eq!(
            [channel(&peak, 0), channel(&peak, 1), channel(&peak, 2)],
            [65535, 65535, 65535]
        );
    }

    #[test]
    fn test_pq_saturates_infinity() {
        const F16_INF: u16 = 0x7C00;
        let mut inf = rgb16f_pixel(F16_INF, F16_INF, F16_INF);
        encode_pq_in_place(&mut inf);
        assert_eq!(
            [channel(&inf, 0), channel(&inf, 1), channel(&inf, 2)],
            [65535, 65535, 65535]
        );

        // Brighter than the PQ range saturates too
        assert_eq!(pq_encode(40.0), pq_encode(1.0));
        assert_eq!(pq_encode(f32::NAN), pq_encode(0.0));
    }

    #[test]
    fn test_pq_clamps_negative_and_is_monotonic() {
        let mut negative = rgb16f_pixel(F16_NEG_ONE, F16_NEG_ONE, F16_NEG_ONE);
        encode_pq_in_place(&mut negative);
        assert_eq!(channel(&negative, 1), 0);

        let mut one = rgb16f_pixel(F16_ONE, F16_ONE, F16_ONE);
        encode_pq_in_place(&mut one);
        let sdr_white = channel(&one, 1);
        // 80 nits lands a bit under half of the PQ range
        assert!(sdr_white > 20000 && sdr_white < 40000, "got {sdr_white}");
        assert!(pq_encode(0.5) > pq_encode(0.1));
    }

    #[test]
    fn test_force_opaque() {
        let mut buf = vec![1, 2, 3, 0, 4, 5, 6, 7];
        force_opaque(&mut buf);
        assert_eq!(buf, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }
}
