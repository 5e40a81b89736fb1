// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Image providers
//!
//! A provider accepts one request at a time and answers it exactly once
//! through a completion callback, possibly several frames later and
//! possibly from a worker thread.
//!
//! [`CaptureProvider`] reads the backbuffer: it runs the preparation cycle,
//! triggers the grabber, converts the readback and hands resize and encode
//! to an [`EncodeWorker`]. [`HostFrameProvider`] instead takes the host's own
//! capture once it has been forced to full quality.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::capture::{FrameDesc, FrameGrabber, ScratchBuffers};
use crate::config::{CaptureMode, CaptureSettings, OutputSize};
use crate::convert::{encode_pq_in_place, force_opaque, quantize, Quantization};
use crate::encode::{encode_adaptive, EncodeParams, EncodeWorker, ImageCodec, RgbaView};
use crate::error::{CaptureError, Result};
use crate::hdr::HdrTool;
use crate::host::{self, HookAction, HostAccessor, ObjectRef};
use crate::prepare::{PrepareConfig, PrepareController, PrepareEvent, SimulationClock};
use crate::protocol::{
    names, quantization_target, CanonicalFormat, CaptureStatus, EncodedPayload, HostSaveState,
    MAX_QUALITY,
};
use crate::resize::{resize_rgba8, WorkerPool};
use crate::ui::UiHider;

/// Receives the outcome of a request
pub type CompletionCallback = Box<dyn FnOnce(Result<EncodedPayload>) + Send>;

/// Something that can produce an encoded image on request
pub trait ImageProvider {
    /// Accept a request. Returns false if the request was not taken, in
    /// which case `callback` is dropped without being called.
    fn provide_image(&mut self, wants_16x9: bool, callback: Option<CompletionCallback>) -> bool;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);
}

/// Completion handle that fires its callback exactly once
pub struct CompletionToken {
    callback: Option<CompletionCallback>,
    in_flight: Arc<AtomicBool>,
}

impl CompletionToken {
    /// Wrap `callback`, marking `in_flight` until the token fires
    pub fn new(callback: CompletionCallback, in_flight: Arc<AtomicBool>) -> Self {
        in_flight.store(true, Ordering::SeqCst);
        Self {
            callback: Some(callback),
            in_flight,
        }
    }

    pub fn complete(mut self, result: Result<EncodedPayload>) {
        self.fire(result);
    }

    fn fire(&mut self, result: Result<EncodedPayload>) {
        if let Some(callback) = self.callback.take() {
            self.in_flight.store(false, Ordering::SeqCst);
            callback(result);
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if self.callback.is_some() {
            debug!("Completion token dropped before firing");
            self.fire(Err(CaptureError::Cancelled));
        }
    }
}

/// Accepted request that has not reached the encode worker yet
struct PendingRequest {
    token: CompletionToken,
    wants_16x9: bool,
    frames: u32,
}

// ============================================================================
// Backbuffer provider
// ============================================================================

/// Debug artifacts written for one capture
#[derive(Debug, Clone)]
struct DumpTargets {
    dir: PathBuf,
    seq: u64,
    png: bool,
    payload: bool,
}

impl DumpTargets {
    fn path(&self, extension: &str) -> PathBuf {
        self.dir.join(format!("hq_capture_{}.{extension}", self.seq))
    }
}

/// Everything the worker needs to finish a capture off the frame thread
struct EncodeJob {
    pixels: Vec<u8>,
    len: usize,
    desc: FrameDesc,
    target: CanonicalFormat,
    output: OutputSize,
    params: EncodeParams,
    codec: Arc<dyn ImageCodec>,
    pool: Arc<dyn WorkerPool>,
    hdr_tool: Option<HdrTool>,
    dumps: DumpTargets,
    token: CompletionToken,
    recycle: flume::Sender<Vec<u8>>,
}

impl EncodeJob {
    fn run(mut self) {
        let result = self.produce();
        match &result {
            Ok(payload) => info!(
                "Capture encoded: {} bytes at quality {}",
                payload.len(),
                payload.quality
            ),
            Err(e) => error!("Capture failed: {e}"),
        }

        let pixels = std::mem::take(&mut self.pixels);
        self.token.complete(result);
        // The provider may already be gone
        let _ = self.recycle.send(pixels);
    }

    fn produce(&mut self) -> Result<EncodedPayload> {
        let sdr;
        let (rgba, width, height): (&[u8], u32, u32) = if self.target == CanonicalFormat::Rgba8 {
            (&self.pixels[..self.len], self.desc.width, self.desc.height)
        } else {
            let tool = self.hdr_tool.as_ref().ok_or_else(|| {
                CaptureError::HdrToolFailed("no HDR tool configured".to_string())
            })?;
            if self.target == CanonicalFormat::Rgb16Float {
                encode_pq_in_place(&mut self.pixels[..self.len]);
            }
            sdr = tool.convert(
                &self.pixels[..self.len],
                self.desc.width,
                self.desc.height,
                self.desc.color_space,
            )?;
            (sdr.data.as_slice(), sdr.width, sdr.height)
        };

        let mut resized = Vec::new();
        let (rgba, width, height) = if (width, height) == (self.output.width, self.output.height) {
            (rgba, width, height)
        } else {
            resize_rgba8(
                self.pool.as_ref(),
                rgba,
                width,
                height,
                &mut resized,
                self.output.width,
                self.output.height,
            )?;
            (&resized[..], self.output.width, self.output.height)
        };

        if self.dumps.png {
            dump_png(&self.dumps.path("png"), rgba, width, height);
        }

        let view = RgbaView {
            data: rgba,
            width,
            height,
        };
        let outcome = encode_adaptive(self.codec.as_ref(), view, &self.params)?;
        debug!("Encode took {} attempts", outcome.attempts);

        if self.dumps.payload {
            dump_bytes(&self.dumps.path("webp"), &outcome.payload.bytes);
        }
        Ok(outcome.payload)
    }
}

fn dump_png(path: &Path, rgba: &[u8], width: u32, height: u32) {
    let result = path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .map_err(|e| e.to_string())
        .and_then(|()| {
            image::save_buffer(path, rgba, width, height, image::ColorType::Rgba8)
                .map_err(|e| e.to_string())
        });
    match result {
        Ok(()) => debug!("Dumped capture to {}", path.display()),
        Err(e) => warn!("Could not dump capture to {}: {e}", path.display()),
    }
}

pub(crate) fn dump_bytes(path: &Path, bytes: &[u8]) {
    let result = path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| fs::write(path, bytes));
    match result {
        Ok(()) => debug!("Dumped {} bytes to {}", bytes.len(), path.display()),
        Err(e) => warn!("Could not write {}: {e}", path.display()),
    }
}

/// Provider reading the host backbuffer
pub struct CaptureProvider {
    settings: CaptureSettings,
    grabber: Box<dyn FrameGrabber>,
    codec: Arc<dyn ImageCodec>,
    pool: Arc<dyn WorkerPool>,
    hdr_tool: Option<HdrTool>,
    prepare: PrepareController,
    enabled: bool,
    requested: bool,
    in_flight: Arc<AtomicBool>,
    pending: Option<PendingRequest>,
    awaiting_readback: bool,
    scratch: ScratchBuffers,
    recycle_tx: flume::Sender<Vec<u8>>,
    recycle_rx: flume::Receiver<Vec<u8>>,
    worker: EncodeWorker,
    captures: u64,
}

impl CaptureProvider {
    pub fn new(
        settings: CaptureSettings,
        grabber: Box<dyn FrameGrabber>,
        codec: Arc<dyn ImageCodec>,
        pool: Arc<dyn WorkerPool>,
    ) -> Self {
        let hdr_tool = settings.hdr_tool.as_ref().map(|program| {
            HdrTool::new(
                program.clone(),
                Duration::from_secs(settings.hdr_tool_timeout_secs),
                settings.hdr_bits,
            )
        });
        let (recycle_tx, recycle_rx) = flume::unbounded();

        Self {
            prepare: PrepareController::new(PrepareConfig::from(&settings)),
            enabled: settings.enabled && settings.mode.uses_backbuffer(),
            settings,
            grabber,
            codec,
            pool,
            hdr_tool,
            requested: false,
            in_flight: Arc::new(AtomicBool::new(false)),
            pending: None,
            awaiting_readback: false,
            scratch: ScratchBuffers::new(),
            recycle_tx,
            recycle_rx,
            worker: EncodeWorker::new(),
            captures: 0,
        }
    }

    /// Flag that the next [`ImageProvider::provide_image`] should be served
    pub fn set_requested(&mut self) {
        self.requested = true;
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// Whether a request is accepted and not yet completed
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn prepare(&self) -> &PrepareController {
        &self.prepare
    }

    pub fn ui(&self) -> &UiHider {
        self.prepare.ui()
    }

    /// Camera hook; the camera is held still while a capture is prepared
    pub fn pre_camera_update(&self) -> HookAction {
        if self.prepare.holds_camera() {
            HookAction::SuppressOriginal
        } else {
            HookAction::ContinueOriginal
        }
    }

    /// Turn post effects off while the result screen is up, for modes that
    /// capture without them
    pub fn on_result_screen(&mut self, open: bool) {
        if self.settings.mode.disables_effects_on_result() {
            debug!("Result screen open: {open}, effects {}", !open);
            self.grabber.set_effects_enabled(!open);
        }
    }

    /// Frame update hook
    pub fn on_update(&mut self) {
        if self.prepare.update() == Some(PrepareEvent::Launch) {
            self.launch();
        }
    }

    /// Late update hook, drives the freeze and the request deadline
    pub fn on_late_update(&mut self, clock: &mut dyn SimulationClock) {
        if let Err(e) = self.prepare.late_update(clock) {
            warn!("Could not update simulation speed: {e}");
        }

        if let Some(pending) = self.pending.as_mut() {
            pending.frames += 1;
            if pending.frames >= self.settings.deadline_frames {
                warn!("Capture request timed out after {} frames", pending.frames);
                self.fail(CaptureError::Timeout(self.settings.deadline_frames));
                self.prepare.abort(clock);
            }
        }
    }

    /// End of rendering hook; collects the readback once it is ready
    pub fn on_end_rendering(&mut self) {
        self.prepare.end_rendering();
        self.collect_readback();
    }

    /// Join the encode worker
    pub fn join(&mut self) {
        self.worker.join();
    }

    fn launch(&mut self) {
        let stage = self.settings.mode.capture_stage();
        info!("Launching capture ({stage:?})");

        match self.grabber.request(stage) {
            CaptureStatus::Submitted => self.awaiting_readback = true,
            CaptureStatus::InProgress => {
                self.fail(CaptureError::InProgress);
                self.prepare.finish();
            }
            CaptureStatus::Unavailable => {
                self.fail(CaptureError::Unavailable);
                self.prepare.finish();
            }
        }
    }

    fn fail(&mut self, error: CaptureError) {
        self.awaiting_readback = false;
        if let Some(pending) = self.pending.take() {
            pending.token.complete(Err(error));
        }
    }

    fn collect_readback(&mut self) {
        let Some(readback) = self.grabber.poll(&mut self.scratch.raw) else {
            return;
        };
        self.awaiting_readback = false;
        self.prepare.finish();

        let Some(pending) = self.pending.take() else {
            debug!("Discarding readback with no request waiting for it");
            return;
        };

        match readback {
            Ok(desc) => self.process(desc, pending),
            Err(e) => pending.token.complete(Err(e)),
        }
    }

    /// Convert the readback and hand it to the encode worker
    fn process(&mut self, desc: FrameDesc, pending: PendingRequest) {
        while let Ok(buffer) = self.recycle_rx.try_recv() {
            self.scratch.reclaim_converted(buffer);
        }

        let raw_len = desc.byte_len();
        if self.scratch.raw.len() < raw_len {
            pending.token.complete(Err(CaptureError::Readback(format!(
                "readback holds {} bytes, {}x{} {:?} needs {raw_len}",
                self.scratch.raw.len(),
                desc.width,
                desc.height,
                desc.format
            ))));
            return;
        }

        let target = quantization_target(desc.format, desc.color_space);
        let mut pixels = self.scratch.take_converted();
        let len = match quantize(
            &self.scratch.raw,
            desc.format,
            desc.width,
            desc.height,
            target,
            &mut pixels,
        ) {
            Quantization::Converted { len } => len,
            Quantization::Passthrough => {
                if pixels.len() < raw_len {
                    pixels.resize(raw_len, 0);
                }
                pixels[..raw_len].copy_from_slice(&self.scratch.raw[..raw_len]);
                raw_len
            }
        };
        if target == CanonicalFormat::Rgba8 {
            force_opaque(&mut pixels[..len]);
        }

        self.captures += 1;
        let dumps = DumpTargets {
            dir: self.settings.data_dir.clone(),
            seq: self.captures,
            png: self.settings.dump_capture_png,
            payload: self.settings.dump_payload,
        };

        let job = EncodeJob {
            pixels,
            len,
            desc,
            target,
            output: self.settings.output_size(pending.wants_16x9),
            params: EncodeParams {
                lossless: self.settings.lossless,
                start_quality: self.settings.start_quality(),
                budget: self.settings.size_limit.max_bytes(),
            },
            codec: self.codec.clone(),
            pool: self.pool.clone(),
            hdr_tool: self.hdr_tool.clone(),
            dumps,
            token: pending.token,
            recycle: self.recycle_tx.clone(),
        };

        debug!(
            "Readback {}x{} {:?} -> {target:?}, handing to encode worker",
            desc.width, desc.height, desc.format
        );
        // A job that fails to start is dropped, which cancels its token
        if let Err(e) = self.worker.spawn(move || job.run()) {
            error!("Could not start encode worker: {e}");
        }
    }
}

impl ImageProvider for CaptureProvider {
    fn provide_image(&mut self, wants_16x9: bool, callback: Option<CompletionCallback>) -> bool {
        if !self.enabled {
            debug!("Capture provider disabled");
            return false;
        }
        if !self.requested {
            debug!("No capture requested");
            return false;
        }
        let Some(callback) = callback else {
            warn!("Capture requested without a completion callback");
            return false;
        };
        if self.is_in_flight() || self.pending.is_some() {
            warn!("Capture already in flight");
            return false;
        }
        if !self.prepare.begin() {
            return false;
        }

        self.requested = false;
        self.pending = Some(PendingRequest {
            token: CompletionToken::new(callback, self.in_flight.clone()),
            wants_16x9,
            frames: 0,
        });
        info!("Capture request accepted (16:9: {wants_16x9})");
        true
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.requested = false;
            if self.pending.is_some() {
                info!("Capture provider disabled with a request pending");
                self.fail(CaptureError::Disabled);
            }
        }
    }
}

impl Drop for CaptureProvider {
    fn drop(&mut self) {
        self.fail(CaptureError::Cancelled);
        self.worker.join();
    }
}

// ============================================================================
// Host frame provider
// ============================================================================

/// Provider handing out the host's own capture at full quality
pub struct HostFrameProvider {
    enabled: bool,
    host_wait_frames: i32,
    wait_frames_left: i32,
    done: bool,
    result: Vec<u8>,
    budget: usize,
    waiting: Option<CompletionToken>,
    waiting_frames: u32,
    deadline_frames: u32,
    in_flight: Arc<AtomicBool>,
    dump_dir: Option<PathBuf>,
}

impl HostFrameProvider {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            enabled: settings.enabled && settings.mode == CaptureMode::EngineFrame,
            host_wait_frames: settings.host_wait_frames,
            wait_frames_left: settings.host_wait_frames,
            done: false,
            result: Vec::new(),
            budget: settings.size_limit.max_bytes(),
            waiting: None,
            waiting_frames: 0,
            deadline_frames: settings.deadline_frames,
            in_flight: Arc::new(AtomicBool::new(false)),
            dump_dir: settings.dump_payload.then(|| settings.data_dir.clone()),
        }
    }

    /// Whether the host capture has been copied and not handed out yet
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn payload(&self) -> EncodedPayload {
        EncodedPayload {
            bytes: self.result.clone(),
            quality: MAX_QUALITY,
            within_budget: self.result.len() < self.budget,
        }
    }

    /// Pre-hook of the host's save capture update
    pub fn pre_update(&mut self, host: &mut dyn HostAccessor, album: ObjectRef) -> HookAction {
        if !self.enabled {
            return HookAction::ContinueOriginal;
        }

        let state = match host::save_state(host, album) {
            Ok(state) => state,
            Err(e) => {
                warn!("Host frame provider: {e}");
                return HookAction::ContinueOriginal;
            }
        };

        if state <= HostSaveState::Start {
            self.done = false;
            self.wait_frames_left = self.host_wait_frames;
        }

        if state == HostSaveState::CopyToStaging {
            match host::read_u32(host, album, names::QUALITY) {
                Ok(quality) if quality < u32::from(MAX_QUALITY) => {
                    info!("Host capture quality {quality}, raising to {MAX_QUALITY}");
                    if let Err(e) = host.set_field(
                        album,
                        names::QUALITY,
                        host::HostValue::U32(u32::from(MAX_QUALITY)),
                    ) {
                        warn!("Could not raise host capture quality: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Host frame provider: {e}"),
            }

            self.wait_frames_left -= 1;
            if self.wait_frames_left > 0 {
                return HookAction::SuppressOriginal;
            }
            debug!("Host capture delay over");
        }

        if !self.done && state == HostSaveState::WaitSerialize {
            self.try_copy_result(host, album);
        }

        HookAction::ContinueOriginal
    }

    fn try_copy_result(&mut self, host: &mut dyn HostAccessor, album: ObjectRef) {
        match host::read_u32(host, album, names::QUALITY) {
            Ok(quality) if quality < u32::from(MAX_QUALITY) => {
                debug!("Host capture quality {quality}, not taking it");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Host frame provider: {e}");
                return;
            }
        }

        let copied = host::read_object(host, album, names::SERIALIZED_RESULT).and_then(|result| {
            let completed = host.call(result, names::GET_COMPLETED, &[])?;
            if completed.as_bool() != Some(true) {
                return Ok(None);
            }
            let content = host.call(result, names::GET_CONTENT, &[])?;
            let content = content.as_object().ok_or_else(|| {
                CaptureError::HostField(format!("{} returned no array", names::GET_CONTENT))
            })?;
            host::read_byte_array(host, content).map(Some)
        });

        match copied {
            Ok(Some(bytes)) => {
                info!("Copied {} byte host capture", bytes.len());
                self.result = bytes;
                self.done = true;
                if let Some(dir) = &self.dump_dir {
                    dump_bytes(&dir.join("hq_capture_host.webp"), &self.result);
                }
                if let Some(token) = self.waiting.take() {
                    token.complete(Ok(self.payload()));
                    self.done = false;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Unable to retrieve host capture: {e}"),
        }
    }

    /// Deadline check for a request waiting on the host
    pub fn on_late_update(&mut self) {
        if self.waiting.is_none() {
            return;
        }
        self.waiting_frames += 1;
        if self.waiting_frames >= self.deadline_frames
            && let Some(token) = self.waiting.take()
        {
            warn!("Host capture timed out after {} frames", self.waiting_frames);
            token.complete(Err(CaptureError::Timeout(self.deadline_frames)));
        }
    }
}

impl ImageProvider for HostFrameProvider {
    fn provide_image(&mut self, _wants_16x9: bool, callback: Option<CompletionCallback>) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(callback) = callback else {
            return false;
        };
        if self.in_flight.load(Ordering::SeqCst) {
            warn!("Host capture already requested");
            return false;
        }

        let token = CompletionToken::new(callback, self.in_flight.clone());
        if self.done {
            token.complete(Ok(self.payload()));
            self.done = false;
        } else {
            self.waiting = Some(token);
            self.waiting_frames = 0;
        }
        true
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled && let Some(token) = self.waiting.take() {
            info!("Host frame provider disabled with a request waiting");
            token.complete(Err(CaptureError::Disabled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::stub::StubGrabber;
    use crate::encode::tests::ScriptedCodec;
    use crate::host::HostValue;
    use crate::prepare::tests::FakeClock;
    use crate::protocol::{PixelFormat, SizeLimitMode, LEGACY_PAYLOAD_LIMIT};
    use crate::resize::InlinePool;
    use crate::sim::SimulatedHost;
    use std::sync::Mutex;

    type Outcomes = Arc<Mutex<Vec<Result<EncodedPayload>>>>;

    fn recorder() -> (Outcomes, CompletionCallback) {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let callback: CompletionCallback = Box::new(move |r| sink.lock().unwrap().push(r));
        (outcomes, callback)
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            output_16x9: OutputSize::new(16, 9),
            output_21x9: OutputSize::new(21, 9),
            data_dir: std::env::temp_dir(),
            ..Default::default()
        }
    }

    fn provider(settings: CaptureSettings, grabber: StubGrabber, sizes: &[usize]) -> CaptureProvider {
        CaptureProvider::new(
            settings,
            Box::new(grabber),
            Arc::new(ScriptedCodec::new(sizes, 1000)),
            Arc::new(InlinePool),
        )
    }

    fn frame(provider: &mut CaptureProvider, clock: &mut FakeClock) {
        provider.on_update();
        provider.on_late_update(clock);
        provider.on_end_rendering();
    }

    #[test]
    fn test_token_fires_once() {
        let (outcomes, callback) = recorder();
        let in_flight = Arc::new(AtomicBool::new(false));

        let token = CompletionToken::new(callback, in_flight.clone());
        assert!(in_flight.load(Ordering::SeqCst));
        token.complete(Ok(EncodedPayload::default()));

        assert!(!in_flight.load(Ordering::SeqCst));
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], Ok(_)));
    }

    #[test]
    fn test_dropped_token_cancels() {
        let (outcomes, callback) = recorder();
        let in_flight = Arc::new(AtomicBool::new(false));

        drop(CompletionToken::new(callback, in_flight.clone()));

        assert!(!in_flight.load(Ordering::SeqCst));
        assert!(matches!(
            outcomes.lock().unwrap()[0],
            Err(CaptureError::Cancelled)
        ));
    }

    #[test]
    fn test_provide_image_rejections() {
        let grabber = StubGrabber::new(FrameDesc::new(16, 9, PixelFormat::Bgra8));
        let mut provider = provider(settings(), grabber, &[]);

        // Not requested
        let (_, callback) = recorder();
        assert!(!provider.provide_image(true, Some(callback)));

        // No callback
        provider.set_requested();
        assert!(!provider.provide_image(true, None));

        // Disabled
        provider.set_enabled(false);
        let (_, callback) = recorder();
        assert!(!provider.provide_image(true, Some(callback)));
        provider.set_enabled(true);

        let (_, callback) = recorder();
        assert!(provider.provide_image(true, Some(callback)));
        assert!(provider.is_in_flight());

        // Single flight
        provider.set_requested();
        let (_, callback) = recorder();
        assert!(!provider.provide_image(true, Some(callback)));
    }

    #[test]
    fn test_disabling_fails_pending_request() {
        let grabber = StubGrabber::new(FrameDesc::new(16, 9, PixelFormat::Bgra8));
        let probe = grabber.probe();
        let mut provider = provider(settings(), grabber, &[]);
        let mut clock = FakeClock::new(1.0);
        let (outcomes, callback) = recorder();

        provider.set_requested();
        assert!(provider.provide_image(true, Some(callback)));
        provider.set_enabled(false);

        assert!(!provider.is_in_flight());
        assert!(matches!(
            outcomes.lock().unwrap()[0],
            Err(CaptureError::Disabled)
        ));

        // The prepare cycle still runs out, its readback is discarded
        for _ in 0..30 {
            frame(&mut provider, &mut clock);
        }
        provider.join();
        assert_eq!(probe.requests(), 1);
        assert_eq!(outcomes.lock().unwrap().len(), 1);
        assert_eq!(clock.speed, 1.0);
    }

    #[test]
    fn test_capture_delivers_payload() {
        let grabber = StubGrabber::new(FrameDesc::new(32, 18, PixelFormat::Bgra8));
        let probe = grabber.probe();
        let mut provider = provider(settings(), grabber, &[500]);
        let mut clock = FakeClock::new(1.0);
        let (outcomes, callback) = recorder();

        provider.set_requested();
        assert!(provider.provide_image(true, Some(callback)));
        assert_eq!(provider.pre_camera_update(), HookAction::SuppressOriginal);

        for _ in 0..30 {
            frame(&mut provider, &mut clock);
        }
        provider.join();

        assert_eq!(probe.requests(), 1);
        assert_eq!(provider.pre_camera_update(), HookAction::ContinueOriginal);
        assert!(!provider.is_in_flight());
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        let payload = outcomes[0].as_ref().unwrap();
        assert_eq!(payload.len(), 500);
        assert!(payload.within_budget);
        // Time runs again
        assert_eq!(clock.speed, 1.0);
    }

    #[test]
    fn test_unavailable_grabber_fails_request() {
        let grabber = StubGrabber::new(FrameDesc::new(16, 9, PixelFormat::Bgra8))
            .with_status(CaptureStatus::Unavailable);
        let mut provider = provider(settings(), grabber, &[]);
        let mut clock = FakeClock::new(1.0);
        let (outcomes, callback) = recorder();

        provider.set_requested();
        provider.provide_image(false, Some(callback));
        for _ in 0..10 {
            frame(&mut provider, &mut clock);
        }

        assert!(matches!(
            outcomes.lock().unwrap()[0],
            Err(CaptureError::Unavailable)
        ));
        assert_eq!(provider.pre_camera_update(), HookAction::ContinueOriginal);
    }

    #[test]
    fn test_readback_failure_is_reported() {
        let grabber = StubGrabber::new(FrameDesc::new(16, 9, PixelFormat::Bgra8)).with_failing_readback();
        let mut provider = provider(settings(), grabber, &[]);
        let mut clock = FakeClock::new(1.0);
        let (outcomes, callback) = recorder();

        provider.set_requested();
        provider.provide_image(true, Some(callback));
        for _ in 0..10 {
            frame(&mut provider, &mut clock);
        }

        assert!(matches!(
            outcomes.lock().unwrap()[0],
            Err(CaptureError::Readback(_))
        ));
        assert!(!provider.is_in_flight());
    }

    #[test]
    fn test_deadline_times_out() {
        // The readback never arrives within the deadline
        let grabber = StubGrabber::new(FrameDesc::new(16, 9, PixelFormat::Bgra8)).with_latency(1000);
        let settings = CaptureSettings {
            deadline_frames: 20,
            ..settings()
        };
        let mut provider = provider(settings, grabber, &[]);
        let mut clock = FakeClock::new(0.5);
        let (outcomes, callback) = recorder();

        provider.set_requested();
        provider.provide_image(true, Some(callback));
        for _ in 0..25 {
            frame(&mut provider, &mut clock);
        }

        assert!(matches!(
            outcomes.lock().unwrap()[0],
            Err(CaptureError::Timeout(20))
        ));
        assert_eq!(clock.speed, 0.5);
        assert!(!provider.is_in_flight());
        assert_eq!(provider.pre_camera_update(), HookAction::ContinueOriginal);
    }

    #[test]
    fn test_hdr_without_tool_fails() {
        let grabber = StubGrabber::new(FrameDesc::new(4, 4, PixelFormat::Rgba16Float));
        let mut provider = provider(settings(), grabber, &[]);
        let mut clock = FakeClock::new(1.0);
        let (outcomes, callback) = recorder();

        provider.set_requested();
        provider.provide_image(true, Some(callback));
        for _ in 0..20 {
            frame(&mut provider, &mut clock);
        }
        provider.join();

        assert!(matches!(
            outcomes.lock().unwrap()[0],
            Err(CaptureError::HdrToolFailed(_))
        ));
    }

    #[test]
    fn test_result_screen_toggles_effects() {
        let grabber = StubGrabber::new(FrameDesc::new(4, 4, PixelFormat::Bgra8));
        let probe = grabber.probe();
        let settings = CaptureSettings {
            mode: CaptureMode::NoReshade,
            ..settings()
        };
        let mut provider = provider(settings, grabber, &[]);

        provider.on_result_screen(true);
        assert!(!probe.effects_enabled());
        provider.on_result_screen(false);
        assert!(probe.effects_enabled());

        let grabber = StubGrabber::new(FrameDesc::new(4, 4, PixelFormat::Bgra8));
        let probe = grabber.probe();
        let mut provider = self::provider(self::settings(), grabber, &[]);
        provider.on_result_screen(true);
        assert!(probe.effects_enabled());
    }

    fn host_settings() -> CaptureSettings {
        CaptureSettings {
            mode: CaptureMode::EngineFrame,
            host_wait_frames: 2,
            ..settings()
        }
    }

    #[test]
    fn test_host_frame_forces_quality_and_delays() {
        let mut host = SimulatedHost::new();
        let album = host.singleton(names::ALBUM_MANAGER).unwrap();
        let mut provider = HostFrameProvider::new(&host_settings());

        host.set_field(album, names::SAVE_CAPTURE_STATE, HostValue::I32(2))
            .unwrap();
        assert_eq!(provider.pre_update(&mut host, album), HookAction::ContinueOriginal);

        host.set_field(album, names::SAVE_CAPTURE_STATE, HostValue::I32(3))
            .unwrap();
        assert_eq!(provider.pre_update(&mut host, album), HookAction::SuppressOriginal);
        assert_eq!(host::read_u32(&mut host, album, names::QUALITY).unwrap(), 100);
        assert_eq!(provider.pre_update(&mut host, album), HookAction::ContinueOriginal);
    }

    #[test]
    fn test_host_frame_delivers_to_waiting_callback() {
        let mut host = SimulatedHost::new();
        let album = host.singleton(names::ALBUM_MANAGER).unwrap();
        let mut provider = HostFrameProvider::new(&host_settings());
        let (outcomes, callback) = recorder();

        assert!(provider.provide_image(true, Some(callback)));
        assert!(outcomes.lock().unwrap().is_empty());

        host.set_field(album, names::QUALITY, HostValue::U32(100)).unwrap();
        host.stage_serialized_result(b"host-bytes", true);
        host.set_field(album, names::SAVE_CAPTURE_STATE, HostValue::I32(6))
            .unwrap();
        provider.pre_update(&mut host, album);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes[0].as_ref().unwrap().bytes, b"host-bytes");
        assert!(!provider.is_done());
    }

    #[test]
    fn test_host_frame_fast_path() {
        let mut host = SimulatedHost::new();
        let album = host.singleton(names::ALBUM_MANAGER).unwrap();
        let mut provider = HostFrameProvider::new(&host_settings());

        host.set_field(album, names::QUALITY, HostValue::U32(100)).unwrap();
        host.stage_serialized_result(b"early", true);
        host.set_field(album, names::SAVE_CAPTURE_STATE, HostValue::I32(6))
            .unwrap();
        provider.pre_update(&mut host, album);
        assert!(provider.is_done());

        let (outcomes, callback) = recorder();
        assert!(provider.provide_image(false, Some(callback)));
        assert_eq!(outcomes.lock().unwrap()[0].as_ref().unwrap().bytes, b"early");
        assert!(!provider.is_done());
    }

    #[test]
    fn test_host_frame_budget_follows_size_limit() {
        let oversized = vec![7u8; LEGACY_PAYLOAD_LIMIT + 1];
        let cases = [(SizeLimitMode::Legacy, false), (SizeLimitMode::Extended, true)];
        for (size_limit, within_budget) in cases {
            let mut host = SimulatedHost::new();
            let album = host.singleton(names::ALBUM_MANAGER).unwrap();
            let mut provider = HostFrameProvider::new(&CaptureSettings {
                size_limit,
                ..host_settings()
            });

            host.set_field(album, names::QUALITY, HostValue::U32(100)).unwrap();
            host.stage_serialized_result(&oversized, true);
            host.set_field(album, names::SAVE_CAPTURE_STATE, HostValue::I32(6))
                .unwrap();
            provider.pre_update(&mut host, album);

            let (outcomes, callback) = recorder();
            assert!(provider.provide_image(true, Some(callback)));
            let outcomes = outcomes.lock().unwrap();
            assert_eq!(outcomes[0].as_ref().unwrap().within_budget, within_budget);
        }
    }

    #[test]
    fn test_host_frame_disabling_fails_waiting_request() {
        let mut provider = HostFrameProvider::new(&host_settings());
        let (outcomes, callback) = recorder();

        assert!(provider.provide_image(true, Some(callback)));
        provider.set_enabled(false);

        assert!(matches!(
            outcomes.lock().unwrap()[0],
            Err(CaptureError::Disabled)
        ));
        let (_, callback) = recorder();
        assert!(!provider.provide_image(true, Some(callback)));
    }

    #[test]
    fn test_host_frame_skips_low_quality() {
        let mut host = SimulatedHost::new();
        let album = host.singleton(names::ALBUM_MANAGER).unwrap();
        let mut provider = HostFrameProvider::new(&host_settings());

        host.set_field(album, names::QUALITY, HostValue::U32(60)).unwrap();
        host.stage_serialized_result(b"low", true);
        host.set_field(album, names::SAVE_CAPTURE_STATE, HostValue::I32(6))
            .unwrap();
        provider.pre_update(&mut host, album);

        assert!(!provider.is_done());
    }
}
