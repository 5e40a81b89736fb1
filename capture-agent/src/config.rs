// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture settings
//!
//! Settings are a plain serde structure stored as JSON. Missing keys take
//! their default, so older settings files keep loading.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::protocol::{CaptureStage, SizeLimitMode, MAX_FREEZE_FRAMES, MAX_QUALITY};

/// Where the high-quality frame comes from
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Backbuffer read after post effects were applied
    ReshadePreapplied,
    /// Backbuffer read before post effects, effects re-applied by the viewer
    #[default]
    ReshadeApplyLater,
    /// Backbuffer read with post effects disabled
    NoReshade,
    /// The host's own capture, forced to maximum quality
    EngineFrame,
}

impl CaptureMode {
    /// Whether this mode reads the backbuffer itself
    pub fn uses_backbuffer(&self) -> bool {
        !matches!(self, CaptureMode::EngineFrame)
    }

    /// Point in the present chain to read from
    pub fn capture_stage(&self) -> CaptureStage {
        match self {
            CaptureMode::ReshadePreapplied => CaptureStage::AfterEffects,
            _ => CaptureStage::BeforeEffects,
        }
    }

    /// Whether post effects are switched off while the host shows its result screen
    pub fn disables_effects_on_result(&self) -> bool {
        matches!(self, CaptureMode::NoReshade | CaptureMode::ReshadePreapplied)
    }
}

/// Order of the two preparation steps before a capture
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareOrder {
    /// Freeze simulation time, then hide the UI
    #[default]
    FreezeThenHide,
    /// Hide the UI, then freeze if artifact fixing is enabled
    HideThenFreeze,
}

/// Mandated output size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSize {
    pub width: u32,
    pub height: u32,
}

impl OutputSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Master switch
    pub enabled: bool,
    /// Encode losslessly (single attempt, no budget retry)
    pub lossless: bool,
    /// Quality the adaptive encoder starts at
    pub max_quality: u8,
    /// Lowest quality the starting point is clamped to
    pub min_quality: u8,
    /// Payload budget
    pub size_limit: SizeLimitMode,
    /// Bit depth of the HDR intermediate
    pub hdr_bits: u8,
    /// Frames simulation time is held frozen
    pub freeze_frames: i32,
    /// Frames the UI is hidden for, `None` hides until released
    pub hide_ui_frames: Option<i32>,
    /// Order of freeze and hide
    pub prepare_order: PrepareOrder,
    /// Freeze simulation time after hiding (hide-first order only)
    pub fix_artifacts: bool,
    /// Frames the host capture is held back after the quality override
    pub host_wait_frames: i32,
    /// Frames a request may stay pending before it fails
    pub deadline_frames: u32,
    /// Frame source
    pub mode: CaptureMode,
    /// Write the captured frame as PNG into `data_dir`
    pub dump_capture_png: bool,
    /// Write encoded and host payloads into `data_dir`
    pub dump_payload: bool,
    /// Directory for debug artifacts
    pub data_dir: PathBuf,
    /// External HDR to SDR tool
    pub hdr_tool: Option<PathBuf>,
    /// Seconds the HDR tool may run
    pub hdr_tool_timeout_secs: u64,
    /// Output size for 16:9 requests
    pub output_16x9: OutputSize,
    /// Output size for 21:9 requests
    pub output_21x9: OutputSize,
    /// Photo mode always uses the 16:9 size
    pub photo_mode: bool,
    /// Trace every state machine tick
    pub heavy_debug_logging: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            lossless: false,
            max_quality: MAX_QUALITY,
            min_quality: crate::protocol::MIN_QUALITY,
            size_limit: SizeLimitMode::Extended,
            hdr_bits: 11,
            freeze_frames: 5,
            hide_ui_frames: Some(6),
            prepare_order: PrepareOrder::FreezeThenHide,
            fix_artifacts: true,
            host_wait_frames: 6,
            deadline_frames: 600,
            mode: CaptureMode::ReshadeApplyLater,
            dump_capture_png: false,
            dump_payload: false,
            data_dir: default_data_dir(),
            hdr_tool: None,
            hdr_tool_timeout_secs: 30,
            output_16x9: OutputSize::new(1920, 1080),
            output_21x9: OutputSize::new(2560, 1080),
            photo_mode: false,
            heavy_debug_logging: false,
        }
    }
}

/// Platform data directory for debug artifacts
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hq-capture")
}

impl CaptureSettings {
    /// Load settings from a JSON file, falling back to defaults if it does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let settings: Self =
            serde_json::from_str(&text).map_err(|e| CaptureError::Config(e.to_string()))?;
        settings.validate()?;

        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Save settings as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text =
            serde_json::to_string_pretty(self).map_err(|e| CaptureError::Config(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.min_quality > MAX_QUALITY {
            return Err(CaptureError::Config(format!(
                "min_quality {} exceeds {MAX_QUALITY}",
                self.min_quality
            )));
        }
        if !(8..=16).contains(&self.hdr_bits) {
            return Err(CaptureError::Config(format!(
                "hdr_bits {} outside 8..=16",
                self.hdr_bits
            )));
        }
        for size in [self.output_16x9, self.output_21x9] {
            if size.width == 0 || size.height == 0 {
                return Err(CaptureError::Config("output size must be non-zero".into()));
            }
        }
        Ok(())
    }

    /// Starting quality of the adaptive encoder
    pub fn start_quality(&self) -> u8 {
        self.max_quality.clamp(self.min_quality.min(MAX_QUALITY), MAX_QUALITY)
    }

    /// Freeze length, clamped to the supported range
    pub fn freeze_budget(&self) -> i32 {
        self.freeze_frames
            .clamp(crate::protocol::MIN_FREEZE_FRAMES, MAX_FREEZE_FRAMES)
    }

    /// Output size mandated for a request
    pub fn output_size(&self, wants_16x9: bool) -> OutputSize {
        if self.photo_mode || wants_16x9 {
            self.output_16x9
        } else {
            self.output_21x9
        }
    }
}
