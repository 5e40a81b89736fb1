// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Payload encoder
//!
//! Lossless mode makes a single attempt. Lossy mode walks quality down in
//! fixed steps until the payload fits the byte budget or the floor is
//! reached; an oversized result at the floor is still returned, only an
//! empty codec result is an error.
//!
//! Encoding latency is unbounded, so it only ever runs on the
//! [`EncodeWorker`] thread.

use std::io;
use std::thread;

use log::{debug, error, warn};

use crate::error::{CaptureError, Result};
use crate::protocol::{EncodedPayload, MAX_QUALITY, MIN_QUALITY, QUALITY_STEP};

/// Borrowed tightly packed RGBA8 image
#[derive(Debug, Clone, Copy)]
pub struct RgbaView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// Bytes owned by the codec. Dropping the value hands the allocation back
/// to the codec, so every attempt releases its buffer even when the result
/// is thrown away for a retry.
pub type CodecBuffer = Box<dyn AsRef<[u8]>>;

/// Still-image codec
pub trait ImageCodec: Send + Sync {
    /// Encode at a quality in 0..=100
    fn encode_lossy(&self, image: RgbaView<'_>, quality: f32) -> Result<CodecBuffer>;

    /// Encode without loss
    fn encode_lossless(&self, image: RgbaView<'_>) -> Result<CodecBuffer>;
}

/// WebP codec backed by libwebp
#[derive(Debug, Default, Clone, Copy)]
pub struct WebPCodec;

struct WebPBuffer(webp::WebPMemory);

impl AsRef<[u8]> for WebPBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl WebPCodec {
    fn encode(image: RgbaView<'_>, lossless: bool, quality: f32) -> Result<CodecBuffer> {
        let expected = image.width as usize * image.height as usize * 4;
        if image.data.len() < expected {
            return Err(CaptureError::Encode(format!(
                "{} bytes given for a {}x{} image",
                image.data.len(),
                image.width,
                image.height
            )));
        }

        let encoder = webp::Encoder::from_rgba(&image.data[..expected], image.width, image.height);
        let memory = encoder
            .encode_simple(lossless, quality)
            .map_err(|e| CaptureError::Encode(format!("{e:?}")))?;
        Ok(Box::new(WebPBuffer(memory)))
    }
}

impl ImageCodec for WebPCodec {
    fn encode_lossy(&self, image: RgbaView<'_>, quality: f32) -> Result<CodecBuffer> {
        Self::encode(image, false, quality)
    }

    fn encode_lossless(&self, image: RgbaView<'_>) -> Result<CodecBuffer> {
        Self::encode(image, true, f32::from(MAX_QUALITY))
    }
}

/// How a capture is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeParams {
    /// Single lossless attempt
    pub lossless: bool,
    /// First lossy quality; clamped to the floor and 100
    pub start_quality: u8,
    /// Payloads must be strictly smaller than this
    pub budget: usize,
}

/// Result of [`encode_adaptive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOutcome {
    pub payload: EncodedPayload,
    /// Number of codec invocations
    pub attempts: u32,
}

/// Encode `image`, stepping quality down until the budget is met
pub fn encode_adaptive(
    codec: &dyn ImageCodec,
    image: RgbaView<'_>,
    params: &EncodeParams,
) -> Result<EncodeOutcome> {
    if params.lossless {
        let buffer = codec.encode_lossless(image)?;
        let bytes: &[u8] = (*buffer).as_ref();
        if bytes.is_empty() {
            return Err(CaptureError::Encode("lossless encode returned no data".into()));
        }

        debug!("Lossless payload is {} bytes", bytes.len());
        return Ok(EncodeOutcome {
            payload: EncodedPayload {
                bytes: bytes.to_vec(),
                quality: MAX_QUALITY,
                within_budget: bytes.len() < params.budget,
            },
            attempts: 1,
        });
    }

    let mut quality = params.start_quality.clamp(MIN_QUALITY, MAX_QUALITY);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let buffer = codec.encode_lossy(image, f32::from(quality))?;
        let bytes: &[u8] = (*buffer).as_ref();

        if bytes.is_empty() {
            return Err(CaptureError::Encode(format!(
                "lossy encode at quality {quality} returned no data"
            )));
        }

        let fits = bytes.len() < params.budget;
        if fits || quality < MIN_QUALITY + QUALITY_STEP {
            if !fits {
                warn!(
                    "Payload of {} bytes still exceeds {} at quality {quality}",
                    bytes.len(),
                    params.budget
                );
            }
            return Ok(EncodeOutcome {
                payload: EncodedPayload {
                    bytes: bytes.to_vec(),
                    quality,
                    within_budget: fits,
                },
                attempts,
            });
        }

        debug!(
            "Payload of {} bytes at quality {quality} exceeds {}, reducing quality",
            bytes.len(),
            params.budget
        );
        quality -= QUALITY_STEP;
    }
}

/// Owner of the single background encode thread
#[derive(Debug, Default)]
pub struct EncodeWorker {
    handle: Option<thread::JoinHandle<()>>,
}

impl EncodeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join any previous job, then start `job` on a fresh thread
    pub fn spawn<F>(&mut self, job: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.join();

        let handle = thread::Builder::new()
            .name("hq-encode".to_string())
            .spawn(job)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Block until the current job (if any) has finished
    pub fn join(&mut self) {
        if self.handle.take().is_some_and(|h| h.join().is_err()) {
            error!("Encode worker panicked");
        }
    }

    /// Whether a job is still executing
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for EncodeWorker {
    fn drop(&mut self) {
        self.join();
    }
}
