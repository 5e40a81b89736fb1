// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! HDR to SDR through an external tool
//!
//! The PQ or HLG encoded 16-bit frame is written as a PNG into the temp
//! directory, tagged with a cICP chunk naming its BT.2100 primaries and
//! transfer. The tool is run as `tool <input.png> <output.png>` and its
//! output is decoded back to RGBA8.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use image::{ImageBuffer, Rgb};
use log::{debug, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

use crate::error::{CaptureError, Result};
use crate::protocol::ColorSpace;

// ITU-T H.273 code points
const PRIMARIES_BT2100: u8 = 9;
const TRANSFER_PQ: u8 = 16;
const TRANSFER_HLG: u8 = 18;
const MATRIX_IDENTITY: u8 = 0;
const FULL_RANGE: u8 = 1;

/// Signature plus the fixed size IHDR chunk
const PNG_HEADER_LEN: usize = 8 + 12 + 13;

/// Decoded SDR image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdrImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// cICP chunk data for a frame in `color_space`. scRGB frames are PQ
/// encoded before they get here.
pub fn cicp_code_points(color_space: ColorSpace) -> [u8; 4] {
    let transfer = match color_space {
        ColorSpace::Hdr10Hlg => TRANSFER_HLG,
        _ => TRANSFER_PQ,
    };
    [PRIMARIES_BT2100, transfer, MATRIX_IDENTITY, FULL_RANGE]
}

fn png_chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut crc = crc32fast::Hasher::new();
    crc.update(kind);
    crc.update(data);

    let mut chunk = Vec::with_capacity(12 + data.len());
    chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
    chunk.extend_from_slice(kind);
    chunk.extend_from_slice(data);
    chunk.extend_from_slice(&crc.finalize().to_be_bytes());
    chunk
}

/// Write a little-endian RGB16 buffer as a 16-bit PNG, keeping the top
/// `bits` bits of every channel.
pub fn write_hdr_png(
    path: &Path,
    rgb16: &[u8],
    width: u32,
    height: u32,
    bits: u8,
    color_space: ColorSpace,
) -> Result<()> {
    let channels = width as usize * height as usize * 3;
    if rgb16.len() < channels * 2 {
        return Err(CaptureError::HdrNotSaveable(format!(
            "{} bytes given for a {width}x{height} RGB16 image",
            rgb16.len()
        )));
    }

    let mask = !((1u32 << (16 - u32::from(bits.clamp(1, 16)))) - 1) as u16;
    let samples: Vec<u16> = rgb16[..channels * 2]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]) & mask)
        .collect();

    let buffer: ImageBuffer<Rgb<u16>, Vec<u16>> = ImageBuffer::from_raw(width, height, samples)
        .ok_or_else(|| CaptureError::HdrNotSaveable("sample count mismatch".into()))?;
    let mut png = Vec::new();
    buffer
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| CaptureError::HdrNotSaveable(e.to_string()))?;

    if png.get(12..16) != Some(&b"IHDR"[..]) {
        return Err(CaptureError::HdrNotSaveable("encoder wrote no IHDR chunk".into()));
    }
    // cICP has to come before the image data
    let cicp = png_chunk(b"cICP", &cicp_code_points(color_space));
    let mut tagged = Vec::with_capacity(png.len() + cicp.len());
    tagged.extend_from_slice(&png[..PNG_HEADER_LEN]);
    tagged.extend_from_slice(&cicp);
    tagged.extend_from_slice(&png[PNG_HEADER_LEN..]);

    fs::write(path, &tagged).map_err(|e| CaptureError::HdrNotSaveable(format!("{}: {e}", path.display())))
}

/// Removes the intermediate files once conversion is over
struct TempFiles(Vec<PathBuf>);

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in self.0.iter().filter(|p| p.exists()) {
            if let Err(e) = fs::remove_file(path) {
                debug!("Could not remove {}: {e}", path.display());
            }
        }
    }
}

/// External HDR to SDR converter
#[derive(Debug, Clone)]
pub struct HdrTool {
    program: PathBuf,
    timeout: Duration,
    temp_dir: PathBuf,
    bits: u8,
}

impl HdrTool {
    pub fn new<P: Into<PathBuf>>(program: P, timeout: Duration, bits: u8) -> Self {
        Self {
            program: program.into(),
            timeout,
            temp_dir: std::env::temp_dir(),
            bits,
        }
    }

    /// Place intermediates in `dir` instead of the system temp directory
    pub fn with_temp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Convert a PQ or HLG encoded RGB16 frame into an SDR RGBA8 image
    pub fn convert(
        &self,
        rgb16: &[u8],
        width: u32,
        height: u32,
        color_space: ColorSpace,
    ) -> Result<SdrImage> {
        let id = Uuid::new_v4().simple();
        let input = self.temp_dir.join(format!("hq_capture_hdr_{id}.png"));
        let output = self.temp_dir.join(format!("hq_capture_sdr_{id}.png"));
        let _cleanup = TempFiles(vec![input.clone(), output.clone()]);

        write_hdr_png(&input, rgb16, width, height, self.bits, color_space)?;
        self.run(&input, &output)?;

        if !output.exists() {
            return Err(CaptureError::HdrToolFailed(format!(
                "{} produced no output at {}",
                self.program.display(),
                output.display()
            )));
        }

        let decoded = image::open(&output).map_err(|e| CaptureError::HdrDecode(e.to_string()))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();

        debug!("HDR tool produced {width}x{height} SDR image");
        Ok(SdrImage {
            data: rgba.into_raw(),
            width,
            height,
        })
    }

    fn run(&self, input: &Path, output: &Path) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                CaptureError::HdrToolFailed(format!("failed to launch {}: {e}", self.program.display()))
            })?;

        match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => {
                // A failing exit code is tolerated as long as the output exists
                if !status.success() {
                    warn!("{} exited with {status}", self.program.display());
                }
                Ok(())
            }
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(CaptureError::HdrToolFailed(format!(
                    "{} timed out after {}s",
                    self.program.display(),
                    self.timeout.as_secs()
                )))
            }
            Err(e) => Err(CaptureError::HdrToolFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pq_frame(width: u32, height: u32) -> Vec<u8> {
        (0..width * height * 3)
            .flat_map(|i| ((i * 1000) as u16).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_write_hdr_png_is_16_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");

        write_hdr_png(&path, &pq_frame(4, 2), 4, 2, 16, ColorSpace::Hdr10St2084).unwrap();

        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.color(), image::ColorType::Rgb16);
        let rgb = decoded.to_rgb16();
        assert_eq!(rgb.get_pixel(1, 0).0, [3000, 4000, 5000]);
    }

    #[test]
    fn test_write_hdr_png_masks_low_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let frame: Vec<u8> = [0xFFFFu16, 0x1234, 0x0001]
            .iter()
            .flat_map(|c| c.to_le_bytes())
            .collect();

        write_hdr_png(&path, &frame, 1, 1, 11, ColorSpace::Hdr10St2084).unwrap();

        let rgb = image::open(&path).unwrap().to_rgb16();
        assert_eq!(rgb.get_pixel(0, 0).0, [0xFFE0, 0x1220, 0]);
    }

    /// Data of the first `kind` chunk in a PNG file
    fn find_chunk(png: &[u8], kind: &[u8; 4]) -> Option<Vec<u8>> {
        let mut at = 8;
        while at + 12 <= png.len() {
            let len = u32::from_be_bytes([png[at], png[at + 1], png[at + 2], png[at + 3]]) as usize;
            if &png[at + 4..at + 8] == kind {
                return Some(png[at + 8..at + 8 + len].to_vec());
            }
            at += 12 + len;
        }
        None
    }

    #[test]
    fn test_write_hdr_png_tags_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            (ColorSpace::ScRgb, [9, 16, 0, 1]),
            (ColorSpace::Hdr10St2084, [9, 16, 0, 1]),
            (ColorSpace::Hdr10Hlg, [9, 18, 0, 1]),
        ];

        for (color_space, expected) in cases {
            let path = dir.path().join(format!("{color_space:?}.png"));
            write_hdr_png(&path, &pq_frame(2, 2), 2, 2, 16, color_space).unwrap();

            let png = fs::read(&path).unwrap();
            assert_eq!(find_chunk(&png, b"cICP"), Some(expected.to_vec()), "{color_space:?}");
            // The tag sits ahead of the pixel data and the file still decodes
            let cicp = png.windows(4).position(|w| w == b"cICP").unwrap();
            let idat = png.windows(4).position(|w| w == b"IDAT").unwrap();
            assert!(cicp < idat);
            assert_eq!(image::open(&path).unwrap().color(), image::ColorType::Rgb16);
        }
    }

    #[test]
    fn test_write_hdr_png_short_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let result = write_hdr_png(&dir.path().join("x.png"), &[0; 5], 1, 1, 16, ColorSpace::ScRgb);
        assert!(matches!(result, Err(CaptureError::HdrNotSaveable(_))));
    }

    #[test]
    fn test_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        let tool = HdrTool::new(dir.path().join("no-such-tool"), Duration::from_secs(5), 11)
            .with_temp_dir(dir.path());

        let result = tool.convert(&pq_frame(2, 2), 2, 2, ColorSpace::Hdr10St2084);

        assert!(matches!(result, Err(CaptureError::HdrToolFailed(_))));
        // Intermediates are cleaned up
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_output_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        // `cp input output` stands in for a converter
        let tool = HdrTool::new("cp", Duration::from_secs(10), 16).with_temp_dir(dir.path());

        let sdr = tool.convert(&pq_frame(3, 2), 3, 2, ColorSpace::Hdr10Hlg).unwrap();

        assert_eq!((sdr.width, sdr.height), (3, 2));
        assert_eq!(sdr.data.len(), 3 * 2 * 4);
        assert!(sdr.data.chunks_exact(4).all(|p| p[3] == 255));
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = HdrTool::new("false", Duration::from_secs(10), 11).with_temp_dir(dir.path());

        let result = tool.convert(&pq_frame(2, 2), 2, 2, ColorSpace::Hdr10St2084);

        assert!(matches!(result, Err(CaptureError::HdrToolFailed(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_output_undecodable() {
        let dir = tempfile::tempdir().unwrap();
        // `touch input output` leaves an empty output file
        let tool = HdrTool::new("touch", Duration::from_secs(10), 11).with_temp_dir(dir.path());

        let result = tool.convert(&pq_frame(2, 2), 2, 2, ColorSpace::Hdr10St2084);

        assert!(matches!(result, Err(CaptureError::HdrDecode(_))));
    }
}
