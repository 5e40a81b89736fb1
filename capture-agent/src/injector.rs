// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Host save-pipeline synchronizer
//!
//! Hooks the host's per-frame save capture update. When a capture is armed
//! it asks the active provider for an image as soon as the host starts a
//! save, holds the host in `WaitSerialize` until the image is ready, and
//! swaps the host's serialized bytes for ours in `SaveCapture`.
//!
//! The completion callback may fire on the encode worker. It sends the
//! payload tagged with its save cycle and then records that cycle as
//! completed; only the hook thread reads either of them, and anything
//! tagged with an older cycle is discarded there.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::error::Result;
use crate::host::{self, HookAction, HostAccessor, HostValue, ObjectRef};
use crate::protocol::{names, CycleFlags, EncodedPayload, HostSaveState};
use crate::provider::{dump_bytes, CompletionCallback, ImageProvider};

/// Synchronizes injection with the host's save state machine
pub struct SaveSynchronizer {
    flags: CycleFlags,
    inject_pending: bool,
    /// One past the last cycle whose capture completed, 0 for none
    completed: Arc<AtomicU64>,
    /// Bumped on every reset so late callbacks of an old cycle are ignored
    generation: u64,
    payload_tx: flume::Sender<(u64, EncodedPayload)>,
    payload_rx: flume::Receiver<(u64, EncodedPayload)>,
    payload: Option<EncodedPayload>,
    dump_dir: Option<PathBuf>,
    injections: u64,
}

impl SaveSynchronizer {
    pub fn new() -> Self {
        let (payload_tx, payload_rx) = flume::unbounded();
        Self {
            flags: CycleFlags::empty(),
            inject_pending: false,
            completed: Arc::new(AtomicU64::new(0)),
            generation: 0,
            payload_tx,
            payload_rx,
            payload: None,
            dump_dir: None,
            injections: 0,
        }
    }

    /// Also write the host's own bytes to `dir` before they are replaced
    pub fn with_original_dump(mut self, dir: Option<PathBuf>) -> Self {
        self.dump_dir = dir;
        self
    }

    /// Request an image for the next save cycle
    pub fn arm(&mut self) {
        self.inject_pending = true;
    }

    pub fn is_armed(&self) -> bool {
        self.inject_pending
    }

    /// Flags of the current cycle
    pub fn cycle_flags(&self) -> CycleFlags {
        let mut flags = self.flags;
        flags.set(CycleFlags::IS_CAPTURE_DONE, self.is_done());
        flags
    }

    /// Payloads injected so far
    pub fn injections(&self) -> u64 {
        self.injections
    }

    fn is_done(&self) -> bool {
        self.completed.load(Ordering::SeqCst) == self.generation + 1
    }

    fn mark_done(&self) {
        self.completed.fetch_max(self.generation + 1, Ordering::SeqCst);
    }

    /// Callback tied to the current cycle
    fn completion_callback(&self) -> CompletionCallback {
        let tx = self.payload_tx.clone();
        let completed = self.completed.clone();
        let cycle = self.generation;

        Box::new(move |result| {
            match result {
                Ok(payload) => {
                    info!("Capture finished, {} bytes ready for injection", payload.len());
                    if tx.send((cycle, payload)).is_err() {
                        debug!("Save synchronizer is gone, dropping payload");
                    }
                }
                Err(e) => warn!("Capture failed, host keeps its own image: {e}"),
            }
            completed.fetch_max(cycle + 1, Ordering::SeqCst);
        })
    }

    /// Take the payload of the current cycle, dropping older ones
    fn receive_payload(&mut self) {
        while let Ok((cycle, payload)) = self.payload_rx.try_recv() {
            if cycle == self.generation {
                self.payload = Some(payload);
            } else {
                debug!("Dropping capture result of an old save cycle");
            }
        }
    }

    /// Pre-hook: hold the host in `WaitSerialize` until our capture is done
    pub fn pre_update(&mut self, host: &mut dyn HostAccessor, album: ObjectRef) -> HookAction {
        if !self.flags.contains(CycleFlags::HAS_REQUEST_CAPTURE) {
            return HookAction::ContinueOriginal;
        }

        match host::save_state(host, album) {
            Ok(HostSaveState::WaitSerialize) if !self.is_done() => HookAction::SuppressOriginal,
            Ok(_) => HookAction::ContinueOriginal,
            Err(e) => {
                warn!("Save synchronizer: {e}");
                HookAction::ContinueOriginal
            }
        }
    }

    /// Post-hook: request, inject and reset as the host state advances
    pub fn post_update(
        &mut self,
        host: &mut dyn HostAccessor,
        album: ObjectRef,
        provider: &mut dyn ImageProvider,
    ) {
        let state = match host::save_state(host, album) {
            Ok(state) => state,
            Err(e) => {
                warn!("Save synchronizer: {e}");
                return;
            }
        };

        if state >= HostSaveState::Start
            && self.inject_pending
            && !self.flags.contains(CycleFlags::HAS_REQUEST_CAPTURE)
        {
            self.request(host, album, provider);
        }

        // The payload is sent before the cycle is marked done
        let done = self.is_done();
        self.receive_payload();

        if state == HostSaveState::SaveCapture
            && !self.flags.contains(CycleFlags::HAS_INJECTED)
            && done
            && let Some(payload) = self.payload.take()
        {
            self.flags.insert(CycleFlags::HAS_INJECTED);
            match self.inject(host, album, &payload) {
                Ok(()) => {
                    self.injections += 1;
                    info!("Injected {} byte capture", payload.len());
                }
                Err(e) => warn!("Injection abandoned: {e}"),
            }
        }

        if self.flags.contains(CycleFlags::HAS_REQUEST_CAPTURE) && state == HostSaveState::Idle {
            self.reset();
        }
    }

    fn request(&mut self, host: &mut dyn HostAccessor, album: ObjectRef, provider: &mut dyn ImageProvider) {
        self.flags.insert(CycleFlags::HAS_REQUEST_CAPTURE);
        self.inject_pending = false;

        let wants_16x9 = host::read_bool(host, album, names::IS_16X9).unwrap_or_else(|e| {
            error!("Cannot tell if the capture should be 16:9, assuming it is: {e}");
            true
        });

        if !provider.provide_image(wants_16x9, Some(self.completion_callback())) {
            info!("Provider declined the capture, host keeps its own image");
            self.mark_done();
        }
    }

    fn inject(&self, host: &mut dyn HostAccessor, album: ObjectRef, payload: &EncodedPayload) -> Result<()> {
        let serialized = host::read_object(host, album, names::SERIALIZED_RESULT)?;

        if let Some(dir) = &self.dump_dir {
            let original = host.call(serialized, names::GET_CONTENT, &[])?;
            match original.as_object() {
                Some(array) => {
                    let bytes = host::read_byte_array(host, array)?;
                    dump_bytes(&dir.join("hq_capture_original.webp"), &bytes);
                }
                None => debug!("Host has no serialized content to dump"),
            }
        }

        let array = host::write_byte_array(host, &payload.bytes)?;
        host.set_field(serialized, names::CONTENT, HostValue::Object(Some(array)))
    }

    fn reset(&mut self) {
        debug!("Save cycle over, resetting");
        self.generation += 1;
        self.flags = CycleFlags::empty();
        self.payload = None;
        while self.payload_rx.try_recv().is_ok() {}
    }
}

impl Default for SaveSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}
