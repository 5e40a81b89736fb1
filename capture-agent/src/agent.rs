// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture agent main implementation
//!
//! Owns the providers and the save synchronizer and routes the host's
//! frame callbacks to them.

use std::sync::Arc;

use log::{debug, info};

use crate::capture::FrameGrabber;
use crate::config::{CaptureMode, CaptureSettings};
use crate::encode::{ImageCodec, WebPCodec};
use crate::error::Result;
use crate::host::{HookAction, HostAccessor, HostClock, HostHook, ObjectRef};
use crate::injector::SaveSynchronizer;
use crate::prepare::PrepareState;
use crate::protocol::CycleFlags;
use crate::provider::{CaptureProvider, HostFrameProvider, ImageProvider};
use crate::resize::{RayonPool, WorkerPool};

/// Capture agent
pub struct CaptureAgent {
    /// Settings the agent was built with
    settings: CaptureSettings,
    /// Backbuffer provider
    capture: CaptureProvider,
    /// Host capture provider
    host_frame: HostFrameProvider,
    /// Save pipeline hook
    sync: SaveSynchronizer,
}

impl CaptureAgent {
    /// Create an agent encoding WebP on a CPU-sized resize pool
    pub fn new(settings: CaptureSettings, grabber: Box<dyn FrameGrabber>) -> Result<Self> {
        let pool = RayonPool::new(0)?;
        Ok(Self::with_components(
            settings,
            grabber,
            Arc::new(WebPCodec),
            Arc::new(pool),
        ))
    }

    /// Create an agent from explicit components
    pub fn with_components(
        settings: CaptureSettings,
        grabber: Box<dyn FrameGrabber>,
        codec: Arc<dyn ImageCodec>,
        pool: Arc<dyn WorkerPool>,
    ) -> Self {
        let host_frame = HostFrameProvider::new(&settings);
        let sync = SaveSynchronizer::new()
            .with_original_dump(settings.dump_payload.then(|| settings.data_dir.clone()));
        let capture = CaptureProvider::new(settings.clone(), grabber, codec, pool);

        info!(
            "Capture agent ready (mode {:?}, order {:?})",
            settings.mode, settings.prepare_order
        );

        Self {
            settings,
            capture,
            host_frame,
            sync,
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Replace the host's next save with a high quality capture
    pub fn arm_capture(&mut self) {
        if self.settings.mode.uses_backbuffer() {
            self.capture.set_requested();
        }
        self.sync.arm();
        debug!("Capture armed for the next save cycle");
    }

    /// Host opened or closed its capture result screen
    pub fn on_result_screen(&mut self, open: bool) {
        self.capture.on_result_screen(open);
    }

    /// Start of frame
    pub fn on_update(&mut self) {
        self.capture.on_update();
        if self.settings.heavy_debug_logging {
            debug!(
                "Frame: prepare {:?}, ui hidden {}, flags {:?}",
                self.capture.prepare().state(),
                self.is_ui_hidden(),
                self.sync.cycle_flags()
            );
        }
    }

    /// After the host's own late update; owns time scale and deadlines
    pub fn on_late_update(&mut self, host: &mut dyn HostAccessor) {
        let mut clock = HostClock::new(host);
        self.capture.on_late_update(&mut clock);
        self.host_frame.on_late_update();
    }

    /// Camera update hook
    pub fn pre_camera_update(&self) -> HookAction {
        self.capture.pre_camera_update()
    }

    /// End of rendering
    pub fn on_end_rendering(&mut self) {
        self.capture.on_end_rendering();
    }

    /// Whether the host should hide its UI this frame
    pub fn is_ui_hidden(&self) -> bool {
        self.capture.ui().is_hiding()
    }

    pub fn prepare_state(&self) -> PrepareState {
        self.capture.prepare().state()
    }

    /// Flags of the current host save cycle
    pub fn cycle_flags(&self) -> CycleFlags {
        self.sync.cycle_flags()
    }

    /// Payloads injected into the host so far
    pub fn injections(&self) -> u64 {
        self.sync.injections()
    }

    /// Whether a backbuffer capture is accepted and not yet completed
    pub fn is_capture_in_flight(&self) -> bool {
        self.capture.is_in_flight()
    }

    /// Block until the encode worker (if any) has delivered its result
    pub fn wait_for_encode(&mut self) {
        self.capture.join();
    }

    /// Wait for any encode still running
    pub fn stop(&mut self) {
        self.wait_for_encode();
        debug!("Capture agent stopped");
    }
}

/// Provider serving `mode`
fn active_provider<'a>(
    mode: CaptureMode,
    capture: &'a mut CaptureProvider,
    host_frame: &'a mut HostFrameProvider,
) -> &'a mut dyn ImageProvider {
    if mode == CaptureMode::EngineFrame {
        host_frame
    } else {
        capture
    }
}

impl HostHook for CaptureAgent {
    fn pre(&mut self, host: &mut dyn HostAccessor, this: ObjectRef) -> HookAction {
        let action = if self.settings.mode == CaptureMode::EngineFrame {
            self.host_frame.pre_update(host, this)
        } else {
            HookAction::ContinueOriginal
        };
        action.combine(self.sync.pre_update(host, this))
    }

    fn post(&mut self, host: &mut dyn HostAccessor, this: ObjectRef) {
        let provider = active_provider(self.settings.mode, &mut self.capture, &mut self.host_frame);
        self.sync.post_update(host, this, provider);
    }
}

impl Drop for CaptureAgent {
    fn drop(&mut self) {
        self.stop();
    }
}
