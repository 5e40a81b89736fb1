// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame grabber backends
//!
//! A grabber reads the host's backbuffer. Requests are asynchronous: the
//! capture is queued on one frame and the readback is collected with
//! [`FrameGrabber::poll`] on a later one.

use std::fs::File;
use std::path::Path;

use log::{debug, warn};
use memmap2::Mmap;

use crate::error::{CaptureError, Result};
use crate::protocol::{CaptureStage, CaptureStatus, ColorSpace, PixelFormat};

/// Description of a finished readback
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc {
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Backbuffer pixel format
    pub format: PixelFormat,
    /// Swapchain color space
    pub color_space: ColorSpace,
}

impl FrameDesc {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            color_space: ColorSpace::Srgb,
        }
    }

    /// Tightly packed size of the frame in bytes
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Backbuffer capture trait
pub trait FrameGrabber: Send {
    /// Queue a capture of the next presented frame
    fn request(&mut self, stage: CaptureStage) -> CaptureStatus;

    /// Collect a queued capture. Returns `None` while the readback is still
    /// pending or when nothing was requested; otherwise the pixels have been
    /// written to the start of `dst`.
    fn poll(&mut self, dst: &mut Vec<u8>) -> Option<Result<FrameDesc>>;

    /// Turn post-processing effects on or off
    fn set_effects_enabled(&mut self, enabled: bool);

    /// Whether post-processing effects are on
    fn effects_enabled(&self) -> bool;
}

/// Grow-only buffers reused across captures
#[derive(Debug, Default)]
pub struct ScratchBuffers {
    /// Readback copy
    pub raw: Vec<u8>,
    /// Converter output
    pub converted: Vec<u8>,
}

impl ScratchBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the converted buffer for a worker job
    pub fn take_converted(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.converted)
    }

    /// Return a converted buffer once a worker is done with it. The larger
    /// allocation is kept.
    pub fn reclaim_converted(&mut self, buffer: Vec<u8>) {
        if buffer.capacity() > self.converted.capacity() {
            self.converted = buffer;
        }
    }
}

/// Grow a readback buffer to at least `len` bytes and return its first
/// `len`. Never shrinks.
pub fn readback_slice(dst: &mut Vec<u8>, len: usize) -> &mut [u8] {
    if dst.len() < len {
        dst.resize(len, 0);
    }
    &mut dst[..len]
}

/// Grabber that replays a raw dump from disk
pub struct FileGrabber {
    mmap: Mmap,
    desc: FrameDesc,
    pending: bool,
    effects: bool,
}

impl FileGrabber {
    /// Map `path`, which must hold at least one frame described by `desc`
    pub fn open<P: AsRef<Path>>(path: P, desc: FrameDesc) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the mapping is read-only and private to this grabber; the
        // dump is not expected to be modified while it is being replayed.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < desc.byte_len() {
            return Err(CaptureError::Readback(format!(
                "{} holds {} bytes, a {}x{} {:?} frame needs {}",
                path.as_ref().display(),
                mmap.len(),
                desc.width,
                desc.height,
                desc.format,
                desc.byte_len()
            )));
        }

        debug!(
            "Mapped {} ({} bytes) as {}x{} {:?}",
            path.as_ref().display(),
            mmap.len(),
            desc.width,
            desc.height,
            desc.format
        );

        Ok(Self {
            mmap,
            desc,
            pending: false,
            effects: true,
        })
    }

    pub fn desc(&self) -> FrameDesc {
        self.desc
    }
}

impl FrameGrabber for FileGrabber {
    fn request(&mut self, _stage: CaptureStage) -> CaptureStatus {
        if self.pending {
            return CaptureStatus::InProgress;
        }
        self.pending = true;
        CaptureStatus::Submitted
    }

    fn poll(&mut self, dst: &mut Vec<u8>) -> Option<Result<FrameDesc>> {
        if !self.pending {
            return None;
        }
        self.pending = false;
        let len = self.desc.byte_len();
        readback_slice(dst, len).copy_from_slice(&self.mmap[..len]);
        Some(Ok(self.desc))
    }

    fn set_effects_enabled(&mut self, enabled: bool) {
        self.effects = enabled;
    }

    fn effects_enabled(&self) -> bool {
        self.effects
    }
}

/// Stub grabber for testing and the simulator
pub mod stub {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counters shared between a [`StubGrabber`] and whoever inspects it
    #[derive(Debug, Clone, Default)]
    pub struct StubProbe {
        requests: Arc<AtomicUsize>,
        readbacks: Arc<AtomicUsize>,
        effects: Arc<AtomicBool>,
    }

    impl StubProbe {
        /// Captures queued so far
        pub fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        /// Readbacks delivered so far
        pub fn readbacks(&self) -> usize {
            self.readbacks.load(Ordering::SeqCst)
        }

        pub fn effects_enabled(&self) -> bool {
            self.effects.load(Ordering::SeqCst)
        }
    }

    pub struct StubGrabber {
        desc: FrameDesc,
        /// Polls a queued capture stays pending for
        latency: u32,
        pending: Option<u32>,
        status: CaptureStatus,
        fail_readback: bool,
        frame_count: u64,
        probe: StubProbe,
    }

    impl StubGrabber {
        pub fn new(desc: FrameDesc) -> Self {
            let probe = StubProbe::default();
            probe.effects.store(true, Ordering::SeqCst);
            Self {
                desc,
                latency: 1,
                pending: None,
                status: CaptureStatus::Submitted,
                fail_readback: false,
                frame_count: 0,
                probe,
            }
        }

        /// Number of polls a capture stays pending before it is delivered
        pub fn with_latency(mut self, polls: u32) -> Self {
            self.latency = polls;
            self
        }

        /// Answer every request with `status` instead of queueing it
        pub fn with_status(mut self, status: CaptureStatus) -> Self {
            self.status = status;
            self
        }

        /// Make readbacks fail
        pub fn with_failing_readback(mut self) -> Self {
            self.fail_readback = true;
            self
        }

        pub fn probe(&self) -> StubProbe {
            self.probe.clone()
        }

        /// Generate a test pattern in the configured format
        fn fill(&self, dst: &mut [u8]) {
            let bpp = self.desc.format.bytes_per_pixel();
            let width = self.desc.width as usize;
            let phase = (self.frame_count % 256) as u8;

            for (i, pixel) in dst.chunks_exact_mut(bpp).enumerate() {
                let (x, y) = (i % width, i / width);
                match bpp {
                    8 => {
                        // Half floats 0.5, 1.0, 0.25, 1.0
                        for (c, half) in [0x3800u16, 0x3C00, 0x3400, 0x3C00].iter().enumerate() {
                            pixel[c * 2..c * 2 + 2].copy_from_slice(&half.to_le_bytes());
                        }
                    }
                    4 => {
                        pixel[0] = (x as u8).wrapping_add(phase);
                        pixel[1] = (y as u8).wrapping_add(phase);
                        pixel[2] = ((x + y) as u8).wrapping_add(phase);
                        pixel[3] = 255;
                    }
                    _ => pixel.fill((x as u8).wrapping_add(phase)),
                }
            }
        }
    }

    impl FrameGrabber for StubGrabber {
        fn request(&mut self, stage: CaptureStage) -> CaptureStatus {
            if self.status != CaptureStatus::Submitted {
                return self.status;
            }
            if self.pending.is_some() {
                return CaptureStatus::InProgress;
            }

            debug!("Stub capture queued ({stage:?})");
            self.probe.requests.fetch_add(1, Ordering::SeqCst);
            self.pending = Some(self.latency);
            CaptureStatus::Submitted
        }

        fn poll(&mut self, dst: &mut Vec<u8>) -> Option<Result<FrameDesc>> {
            let left = self.pending?;
            if left > 0 {
                self.pending = Some(left - 1);
                return None;
            }
            self.pending = None;

            if self.fail_readback {
                warn!("Stub readback failing on request");
                return Some(Err(CaptureError::Readback("stub readback failure".into())));
            }

            self.fill(readback_slice(dst, self.desc.byte_len()));
            self.frame_count += 1;
            self.probe.readbacks.fetch_add(1, Ordering::SeqCst);

            Some(Ok(self.desc))
        }

        fn set_effects_enabled(&mut self, enabled: bool) {
            self.probe.effects.store(enabled, Ordering::SeqCst);
        }

        fn effects_enabled(&self) -> bool {
            self.probe.effects_enabled()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_frame_desc_len() {
        assert_eq!(FrameDesc::new(4, 2, PixelFormat::Bgra8).byte_len(), 32);
        assert_eq!(FrameDesc::new(4, 2, PixelFormat::Rgba16Float).byte_len(), 64);
        assert_eq!(FrameDesc::new(4, 2, PixelFormat::R8).byte_len(), 8);
    }

    #[test]
    fn test_scratch_buffers_grow_only() {
        let mut scratch = ScratchBuffers::new();
        assert_eq!(readback_slice(&mut scratch.raw, 64).len(), 64);
        assert_eq!(readback_slice(&mut scratch.raw, 16).len(), 16);
        assert_eq!(scratch.raw.len(), 64);

        let mut converted = scratch.take_converted();
        converted.resize(128, 0);
        scratch.reclaim_converted(converted);
        assert_eq!(scratch.converted.len(), 128);

        scratch.reclaim_converted(Vec::new());
        assert_eq!(scratch.converted.len(), 128);
    }

    #[test]
    fn test_stub_request_then_poll() {
        let mut grabber = stub::StubGrabber::new(FrameDesc::new(8, 4, PixelFormat::Bgra8));
        let probe = grabber.probe();
        let mut buf = Vec::new();

        assert!(grabber.poll(&mut buf).is_none());
        assert_eq!(grabber.request(CaptureStage::BeforeEffects), CaptureStatus::Submitted);
        assert_eq!(grabber.request(CaptureStage::BeforeEffects), CaptureStatus::InProgress);

        // One poll of latency
        assert!(grabber.poll(&mut buf).is_none());
        let desc = grabber.poll(&mut buf).unwrap().unwrap();

        assert_eq!((desc.width, desc.height), (8, 4));
        assert_eq!(buf.len(), 8 * 4 * 4);
        assert!(buf.chunks_exact(4).all(|p| p[3] == 255));
        assert_eq!(probe.requests(), 1);
        assert_eq!(probe.readbacks(), 1);
        assert!(grabber.poll(&mut buf).is_none());
    }

    #[test]
    fn test_stub_unavailable() {
        let mut grabber = stub::StubGrabber::new(FrameDesc::new(2, 2, PixelFormat::Rgba8))
            .with_status(CaptureStatus::Unavailable);
        assert_eq!(grabber.request(CaptureStage::AfterEffects), CaptureStatus::Unavailable);
        assert_eq!(grabber.probe().requests(), 0);
    }

    #[test]
    fn test_stub_failing_readback() {
        let mut grabber = stub::StubGrabber::new(FrameDesc::new(2, 2, PixelFormat::Rgba8))
            .with_latency(0)
            .with_failing_readback();
        let mut buf = Vec::new();

        grabber.request(CaptureStage::BeforeEffects);
        let result = grabber.poll(&mut buf).unwrap();
        assert!(matches!(result, Err(CaptureError::Readback(_))));
    }

    #[test]
    fn test_stub_effects_toggle() {
        let mut grabber = stub::StubGrabber::new(FrameDesc::new(2, 2, PixelFormat::Rgba8));
        let probe = grabber.probe();
        assert!(probe.effects_enabled());

        grabber.set_effects_enabled(false);
        assert!(!grabber.effects_enabled());
        assert!(!probe.effects_enabled());
    }

    #[test]
    fn test_file_grabber_replays_dump() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let pixels: Vec<u8> = (0..2 * 2 * 4).map(|i| i as u8).collect();
        file.write_all(&pixels).unwrap();
        file.flush().unwrap();

        let mut grabber = FileGrabber::open(file.path(), FrameDesc::new(2, 2, PixelFormat::Rgba8)).unwrap();
        let mut buf = vec![0xAA; 32];

        assert!(grabber.poll(&mut buf).is_none());
        assert_eq!(grabber.request(CaptureStage::BeforeEffects), CaptureStatus::Submitted);
        let desc = grabber.poll(&mut buf).unwrap().unwrap();

        assert_eq!(desc, grabber.desc());
        assert_eq!(&buf[..16], &pixels[..]);
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn test_file_grabber_rejects_short_dump() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0; 10]).unwrap();
        file.flush().unwrap();

        let result = FileGrabber::open(file.path(), FrameDesc::new(2, 2, PixelFormat::Rgba8));
        assert!(matches!(result, Err(CaptureError::Readback(_))));
    }
}
