// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! hq-capture Capture Agent
//!
//! This crate replaces the low-resolution picture a game writes into its
//! photo album with a full resolution capture of the backbuffer, or with
//! the game's own capture forced to full quality.
//!
//! # Overview
//!
//! The agent is driven by the host's frame callbacks. When a capture is
//! armed it:
//!
//! - **Prepares** the scene: freezes simulation time and hides the UI
//! - **Captures** the backbuffer, converting HDR formats on the way
//! - **Encodes** WebP on a worker thread, stepping quality down to fit the
//!   host's size limit
//! - **Injects** the payload into the host's save pipeline at the right state
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Host Application                       │
//! │  update / late update / camera / end of rendering callbacks │
//! │  album manager: updateSaveCapture hook                      │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Capture Agent                          │
//! │  - Save synchronizer (hold WaitSerialize, inject)           │
//! │  - Prepare controller (freeze time, hide UI)                │
//! │  - Capture provider / host frame provider                   │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Encode Worker                          │
//! │  - Quantize, optional HDR tool                              │
//! │  - Parallel resize                                          │
//! │  - Adaptive WebP encode against the size budget             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use hq_capture::{CaptureAgent, CaptureSettings, HostHook};
//!
//! let mut agent = CaptureAgent::new(CaptureSettings::default(), grabber)?;
//! agent.arm_capture();
//!
//! // Every host frame
//! agent.on_update();
//! let action = agent.pre(host, album);
//! // ... host runs updateSaveCapture unless suppressed ...
//! agent.post(host, album);
//! agent.on_late_update(host);
//! agent.on_end_rendering();
//! ```
//!
//! # Modules
//!
//! - [`agent`]: Orchestrates the components per host frame
//! - [`capture`]: Frame grabber seam
//! - [`config`]: Settings
//! - [`convert`]: Pixel format quantization
//! - [`encode`]: Adaptive encoder and worker
//! - [`hdr`]: External HDR to SDR tool
//! - [`host`]: Host reflection seam
//! - [`injector`]: Host save pipeline synchronizer
//! - [`prepare`]: Freeze and UI hide before a capture
//! - [`protocol`]: Shared definitions
//! - [`provider`]: Image providers and completion tokens
//! - [`resize`]: Parallel resampling
//! - [`sim`]: In-process host used by tests and the CLI
//! - [`ui`]: UI hide countdown

pub mod agent;
pub mod capture;
pub mod config;
pub mod convert;
pub mod encode;
pub mod error;
pub mod hdr;
pub mod host;
pub mod injector;
pub mod prepare;
pub mod protocol;
pub mod provider;
pub mod resize;
pub mod sim;
pub mod ui;

pub use agent::CaptureAgent;
pub use config::{CaptureMode, CaptureSettings, PrepareOrder};
pub use error::{CaptureError, Result};
pub use host::{HookAction, HostAccessor, HostHook};
pub use protocol::*;
