// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared definitions between the capture pipeline and the host
//!
//! Numeric values of [`HostSaveState`] mirror the host's own save pipeline
//! and must be kept in sync with it.

use serde::{Deserialize, Serialize};

/// Lowest quality the adaptive encoder will try
pub const MIN_QUALITY: u8 = 10;

/// Highest encoder quality, also the value forced onto the host's capture
pub const MAX_QUALITY: u8 = 100;

/// Quality decrement between adaptive encode attempts
pub const QUALITY_STEP: u8 = 10;

/// Minimum number of frames simulation time is held frozen
pub const MIN_FREEZE_FRAMES: i32 = 4;

/// Upper bound on the configurable freeze length
pub const MAX_FREEZE_FRAMES: i32 = 16;

/// UI hide progress after which the capture may start
pub const HIDE_PROGRESS_THRESHOLD: f32 = 0.5;

/// Frame count used to measure progress of an indefinite UI hide
pub const INDEFINITE_HIDE_FRAMES: i32 = 6;

/// Simulation speed applied while frozen. Exactly zero breaks some effects.
pub const FROZEN_TIME_SCALE: f32 = 0.000_001;

/// Byte budget accepted by older host versions (256 KiB)
pub const LEGACY_PAYLOAD_LIMIT: usize = 0x40000;

/// Byte budget accepted by current host versions (960 KiB)
pub const EXTENDED_PAYLOAD_LIMIT: usize = 0xF0000;

/// Host type and member names touched by the synchronizer
pub mod names {
    /// Singleton owning the save pipeline
    pub const ALBUM_MANAGER: &str = "app.AlbumManager";
    /// Hooked per-frame method of the save pipeline
    pub const UPDATE_SAVE_CAPTURE: &str = "updateSaveCapture";
    /// Current save-pipeline state (i32)
    pub const SAVE_CAPTURE_STATE: &str = "_SaveCaptureState";
    /// Requested aspect of the capture (bool)
    pub const IS_16X9: &str = "_Is16x9";
    /// Host encoder quality (u32)
    pub const QUALITY: &str = "_Quality";
    /// Serialization job object
    pub const SERIALIZED_RESULT: &str = "_SerializedResult";
    /// Serialized byte array getter on the job
    pub const GET_CONTENT: &str = "get_Content";
    /// Serialized byte array field on the job
    pub const CONTENT: &str = "_Content";
    /// Completion getter on the job
    pub const GET_COMPLETED: &str = "get_Completed";
    /// Managed array length
    pub const GET_LENGTH: &str = "GetLength";
    /// Managed array element read
    pub const GET: &str = "Get";
    /// Managed array element write
    pub const SET: &str = "Set";
    /// Static type holding the global simulation speed
    pub const APPLICATION: &str = "via.Application";
    /// Global simulation speed getter
    pub const GET_GLOBAL_SPEED: &str = "get_GlobalSpeed";
    /// Global simulation speed setter
    pub const SET_GLOBAL_SPEED: &str = "set_GlobalSpeed";
}

/// Raw backbuffer pixel format
#[repr(u32)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit single channel
    R8 = 0,
    /// 8-bit two channels
    Rg8 = 1,
    /// 32-bit RGBA
    #[default]
    Rgba8 = 2,
    /// 32-bit RGB with padding byte
    Rgbx8 = 3,
    /// 32-bit BGRA
    Bgra8 = 4,
    /// 32-bit BGR with padding byte
    Bgrx8 = 5,
    /// 10-bit RGB packed with 2-bit alpha
    Rgb10a2 = 6,
    /// 10-bit BGR packed with 2-bit alpha
    Bgr10a2 = 7,
    /// 64-bit half-float linear RGBA (scRGB)
    Rgba16Float = 8,
}

impl TryFrom<u32> for PixelFormat {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PixelFormat::R8),
            1 => Ok(PixelFormat::Rg8),
            2 => Ok(PixelFormat::Rgba8),
            3 => Ok(PixelFormat::Rgbx8),
            4 => Ok(PixelFormat::Bgra8),
            5 => Ok(PixelFormat::Bgrx8),
            6 => Ok(PixelFormat::Rgb10a2),
            7 => Ok(PixelFormat::Bgr10a2),
            8 => Ok(PixelFormat::Rgba16Float),
            _ => Err("Invalid pixel format value"),
        }
    }
}

impl PixelFormat {
    /// Get bytes per pixel for this format
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::R8 => 1,
            PixelFormat::Rg8 => 2,
            PixelFormat::Rgba16Float => 8,
            _ => 4,
        }
    }
}

/// Canonical layout produced by the converter
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalFormat {
    /// 8-bit RGBA, what the encoder consumes
    #[default]
    Rgba8,
    /// 16-bit unsigned RGB
    Rgb16Unorm,
    /// 16-bit half-float RGB
    Rgb16Float,
    /// 10-bit RGB packed with 2-bit alpha
    Rgb10a2,
}

impl CanonicalFormat {
    /// Get bytes per pixel for this format
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            CanonicalFormat::Rgba8 | CanonicalFormat::Rgb10a2 => 4,
            CanonicalFormat::Rgb16Unorm | CanonicalFormat::Rgb16Float => 6,
        }
    }
}

/// Swapchain color space reported alongside a readback
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    #[default]
    Srgb,
    ScRgb,
    Hdr10St2084,
    Hdr10Hlg,
}

/// Whether a frame in `format` / `color_space` needs the HDR path
pub fn is_hdr(format: PixelFormat, color_space: ColorSpace) -> bool {
    format == PixelFormat::Rgba16Float
        || matches!(color_space, ColorSpace::Hdr10St2084 | ColorSpace::Hdr10Hlg)
}

/// Quantization target for a frame
pub fn quantization_target(format: PixelFormat, color_space: ColorSpace) -> CanonicalFormat {
    if !is_hdr(format, color_space) {
        CanonicalFormat::Rgba8
    } else if format == PixelFormat::Rgba16Float {
        CanonicalFormat::Rgb16Float
    } else {
        CanonicalFormat::Rgb16Unorm
    }
}

/// Host save-pipeline state
#[repr(i32)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HostSaveState {
    #[default]
    Idle = 0,
    WaitUiOff = 1,
    Start = 2,
    CopyToStaging = 3,
    WaitStaging = 4,
    Serialize = 5,
    WaitSerialize = 6,
    SaveCapture = 7,
    WaitSaveCapture = 8,
    WaitSaveCaptureForLinkedSave = 9,
    AfterSave = 10,
}

impl TryFrom<i32> for HostSaveState {
    type Error = &'static str;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(HostSaveState::Idle),
            1 => Ok(HostSaveState::WaitUiOff),
            2 => Ok(HostSaveState::Start),
            3 => Ok(HostSaveState::CopyToStaging),
            4 => Ok(HostSaveState::WaitStaging),
            5 => Ok(HostSaveState::Serialize),
            6 => Ok(HostSaveState::WaitSerialize),
            7 => Ok(HostSaveState::SaveCapture),
            8 => Ok(HostSaveState::WaitSaveCapture),
            9 => Ok(HostSaveState::WaitSaveCaptureForLinkedSave),
            10 => Ok(HostSaveState::AfterSave),
            _ => Err("Invalid host save state value"),
        }
    }
}

impl HostSaveState {
    /// State following this one in a normal save cycle
    pub fn next(self) -> Self {
        match self {
            HostSaveState::Idle => HostSaveState::Idle,
            HostSaveState::WaitUiOff => HostSaveState::Start,
            HostSaveState::Start => HostSaveState::CopyToStaging,
            HostSaveState::CopyToStaging => HostSaveState::WaitStaging,
            HostSaveState::WaitStaging => HostSaveState::Serialize,
            HostSaveState::Serialize => HostSaveState::WaitSerialize,
            HostSaveState::WaitSerialize => HostSaveState::SaveCapture,
            HostSaveState::SaveCapture => HostSaveState::WaitSaveCapture,
            HostSaveState::WaitSaveCapture | HostSaveState::WaitSaveCaptureForLinkedSave => {
                HostSaveState::AfterSave
            }
            HostSaveState::AfterSave => HostSaveState::Idle,
        }
    }
}

/// Result of asking the frame grabber for a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// Capture queued, the readback arrives on a later frame
    Submitted,
    /// Another capture is already running
    InProgress,
    /// No capture mechanism is loaded
    Unavailable,
}

/// Point in the present chain the frame is read from
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStage {
    /// Before post-processing effects are applied
    #[default]
    BeforeEffects,
    /// After post-processing effects are applied
    AfterEffects,
}

/// Payload size budget selected per request
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeLimitMode {
    /// Tighter limit of older host versions
    Legacy,
    /// Current host limit
    #[default]
    Extended,
}

impl SizeLimitMode {
    /// Maximum payload size in bytes (exclusive)
    pub fn max_bytes(&self) -> usize {
        match self {
            SizeLimitMode::Legacy => LEGACY_PAYLOAD_LIMIT,
            SizeLimitMode::Extended => EXTENDED_PAYLOAD_LIMIT,
        }
    }
}

// Per host save cycle flags
bitflags::bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CycleFlags: u32 {
        /// An image was requested from the provider this cycle
        const HAS_REQUEST_CAPTURE = 1 << 0;
        /// The provider finished, with or without a payload
        const IS_CAPTURE_DONE = 1 << 1;
        /// The payload was written into the host
        const HAS_INJECTED = 1 << 2;
    }
}

/// Encoded image handed to the consumer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedPayload {
    /// Encoded bytes
    pub bytes: Vec<u8>,
    /// Quality the bytes were produced at (100 for lossless)
    pub quality: u8,
    /// Whether the payload fits the selected budget
    pub within_budget: bool,
}

impl EncodedPayload {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_save_state_values() {
        assert_eq!(HostSaveState::try_from(6), Ok(HostSaveState::WaitSerialize));
        assert_eq!(HostSaveState::SaveCapture as i32, 7);
        assert_eq!(HostSaveState::try_from(11), Err("Invalid host save state value"));
        assert!(HostSaveState::CopyToStaging > HostSaveState::Start);
    }

    #[test]
    fn test_host_save_state_cycle_returns_to_idle() {
        let mut state = HostSaveState::WaitUiOff;
        for _ in 0..16 {
            state = state.next();
            if state == HostSaveState::Idle {
                break;
            }
        }
        assert_eq!(state, HostSaveState::Idle);
    }

    #[test]
    fn test_hdr_detection() {
        assert!(is_hdr(PixelFormat::Rgba16Float, ColorSpace::ScRgb));
        assert!(is_hdr(PixelFormat::Rgb10a2, ColorSpace::Hdr10St2084));
        assert!(!is_hdr(PixelFormat::Rgb10a2, ColorSpace::Srgb));
        assert_eq!(
            quantization_target(PixelFormat::Rgba16Float, ColorSpace::ScRgb),
            CanonicalFormat::Rgb16Float
        );
        assert_eq!(
            quantization_target(PixelFormat::Bgr10a2, ColorSpace::Hdr10Hlg),
            CanonicalFormat::Rgb16Unorm
        );
        assert_eq!(
            quantization_target(PixelFormat::Bgra8, ColorSpace::Srgb),
            CanonicalFormat::Rgba8
        );
    }

    #[test]
    fn test_size_limits() {
        assert_eq!(SizeLimitMode::Legacy.max_bytes(), 0x40000);
        assert_eq!(SizeLimitMode::default().max_bytes(), 0xF0000);
    }
}
