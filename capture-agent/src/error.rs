// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture error taxonomy
//!
//! Every failure in the pipeline resolves to one of these and is delivered
//! through the completion callback; nothing crosses a worker thread boundary
//! as a panic.

use std::io;

use thiserror::Error;

/// Errors that can occur while producing or injecting a capture
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The provider is switched off
    #[error("Capture provider is disabled")]
    Disabled,

    /// No capture mechanism is loaded in the host
    #[error("Capture mechanism is unavailable")]
    Unavailable,

    /// Another capture is already running in the grabber
    #[error("Another capture is already in progress")]
    InProgress,

    /// Reading the backbuffer failed
    #[error("Backbuffer readback failed: {0}")]
    Readback(String),

    /// The HDR intermediate image could not be written
    #[error("HDR image could not be saved: {0}")]
    HdrNotSaveable(String),

    /// The external HDR tool is missing or produced nothing
    #[error("HDR to SDR conversion failed: {0}")]
    HdrToolFailed(String),

    /// The external HDR tool's output could not be decoded
    #[error("Converted HDR image could not be decoded: {0}")]
    HdrDecode(String),

    /// The codec returned an empty result
    #[error("Encoder produced no data: {0}")]
    Encode(String),

    /// A member expected on a host object is missing or has the wrong type
    #[error("Host member not available: {0}")]
    HostField(String),

    /// The request did not complete before its frame deadline
    #[error("Capture did not complete within {0} frames")]
    Timeout(u32),

    /// The request was dropped without completing
    #[error("Capture request was cancelled")]
    Cancelled,

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Settings failed validation or parsing
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;
