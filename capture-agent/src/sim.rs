// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! In-process stand-in for the host application
//!
//! Models the pieces of the host the agent talks to: the album manager and
//! its save capture state machine, the serialized result with its managed
//! byte array, and the global simulation speed. [`SimulatedHost::run_frame`]
//! drives one host frame through every agent hook in the order the host
//! calls them.

use std::collections::HashMap;

use log::debug;

use crate::agent::CaptureAgent;
use crate::error::{CaptureError, Result};
use crate::host::{HookAction, HostAccessor, HostHook, HostValue, ObjectRef};
use crate::protocol::{names, HostSaveState};

/// Host frame time in seconds
const FRAME_TIME: f64 = 1.0 / 60.0;

/// Quality the host serializes its own captures at
const HOST_DEFAULT_QUALITY: u32 = 80;

/// Private flag backing `get_Completed`
const COMPLETED: &str = "_Completed";

#[derive(Debug, Default)]
struct SimObject {
    fields: HashMap<String, HostValue>,
    bytes: Option<Vec<u8>>,
}

/// Simulated host
#[derive(Debug)]
pub struct SimulatedHost {
    objects: HashMap<u64, SimObject>,
    next_id: u64,
    album: ObjectRef,
    serialized: ObjectRef,
    global_speed: f32,
    scene_time: f64,
    /// Frames the serialization job runs before it completes
    serialize_frames: u32,
    /// Frames left on the running serialization job
    serialize_job: Option<u32>,
    camera_updates: u64,
    frame: u64,
    saved: Vec<Vec<u8>>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    pub fn new() -> Self {
        let mut host = Self {
            objects: HashMap::new(),
            next_id: 1,
            album: ObjectRef(0),
            serialized: ObjectRef(0),
            global_speed: 1.0,
            scene_time: 0.0,
            serialize_frames: 2,
            serialize_job: None,
            camera_updates: 0,
            frame: 0,
            saved: Vec::new(),
        };

        host.serialized = host.alloc(SimObject::default());
        host.objects
            .entry(host.serialized.0)
            .or_default()
            .fields
            .extend([
                (names::CONTENT.to_string(), HostValue::Object(None)),
                (COMPLETED.to_string(), HostValue::Bool(false)),
            ]);

        let album_fields = [
            (names::SAVE_CAPTURE_STATE, HostValue::I32(HostSaveState::Idle as i32)),
            (names::IS_16X9, HostValue::Bool(true)),
            (names::QUALITY, HostValue::U32(HOST_DEFAULT_QUALITY)),
            (names::SERIALIZED_RESULT, HostValue::Object(Some(host.serialized))),
        ];
        host.album = host.alloc(SimObject {
            fields: album_fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
            bytes: None,
        });
        host
    }

    fn alloc(&mut self, object: SimObject) -> ObjectRef {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(id, object);
        ObjectRef(id)
    }

    fn object(&mut self, obj: ObjectRef) -> Result<&mut SimObject> {
        self.objects
            .get_mut(&obj.0)
            .ok_or_else(|| CaptureError::HostField(format!("no object {}", obj.0)))
    }

    fn array(&mut self, obj: ObjectRef) -> Result<&mut Vec<u8>> {
        self.object(obj)?
            .bytes
            .as_mut()
            .ok_or_else(|| CaptureError::HostField(format!("object {} is not an array", obj.0)))
    }

    fn state_value(&self) -> HostSaveState {
        self.objects
            .get(&self.album.0)
            .and_then(|album| album.fields.get(names::SAVE_CAPTURE_STATE))
            .and_then(HostValue::as_i32)
            .and_then(|raw| HostSaveState::try_from(raw).ok())
            .unwrap_or_default()
    }

    fn set_state(&mut self, state: HostSaveState) {
        if let Some(album) = self.objects.get_mut(&self.album.0) {
            album.fields.insert(
                names::SAVE_CAPTURE_STATE.to_string(),
                HostValue::I32(state as i32),
            );
        }
    }

    fn field_of(&self, obj: ObjectRef, name: &str) -> Option<HostValue> {
        self.objects.get(&obj.0).and_then(|o| o.fields.get(name)).copied()
    }

    // ========================================================================
    // Test and driver controls
    // ========================================================================

    /// Start a save cycle, as the host does when a photo is taken
    pub fn request_save(&mut self) {
        debug!("Host starts a save cycle");
        self.set_state(HostSaveState::WaitUiOff);
    }

    pub fn save_state(&self) -> HostSaveState {
        self.state_value()
    }

    pub fn set_is_16x9(&mut self, is_16x9: bool) {
        if let Some(album) = self.objects.get_mut(&self.album.0) {
            album
                .fields
                .insert(names::IS_16X9.to_string(), HostValue::Bool(is_16x9));
        }
    }

    /// Frames the host takes to serialize a capture
    pub fn set_serialize_frames(&mut self, frames: u32) {
        self.serialize_frames = frames;
    }

    /// Put `bytes` into the serialized result as if the host produced them
    pub fn stage_serialized_result(&mut self, bytes: &[u8], completed: bool) {
        let array = self.alloc(SimObject {
            fields: HashMap::new(),
            bytes: Some(bytes.to_vec()),
        });
        let serialized = self.serialized;
        if let Some(result) = self.objects.get_mut(&serialized.0) {
            result
                .fields
                .insert(names::CONTENT.to_string(), HostValue::Object(Some(array)));
            result
                .fields
                .insert(COMPLETED.to_string(), HostValue::Bool(completed));
        }
    }

    /// Bytes currently held by the serialized result
    pub fn serialized_content(&self) -> Option<Vec<u8>> {
        let array = self.field_of(self.serialized, names::CONTENT)?.as_object()?;
        self.objects.get(&array.0)?.bytes.clone()
    }

    /// Drop a field, simulating a host version without it
    pub fn remove_field(&mut self, obj: ObjectRef, name: &str) {
        if let Some(object) = self.objects.get_mut(&obj.0) {
            object.fields.remove(name);
        }
    }

    pub fn global_speed(&self) -> f32 {
        self.global_speed
    }

    /// Simulated time, advanced every frame by the global speed
    pub fn scene_time(&self) -> f64 {
        self.scene_time
    }

    /// Frames in which the camera was allowed to update
    pub fn camera_updates(&self) -> u64 {
        self.camera_updates
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Captures the host wrote to its album, oldest first
    pub fn saved(&self) -> &[Vec<u8>] {
        &self.saved
    }

    /// Bytes the host would serialize at `quality`
    pub fn host_payload(quality: u32) -> Vec<u8> {
        let body = 64 + quality as usize * 8;
        let mut bytes = Vec::with_capacity(body + 12);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&u32::try_from(body + 4).unwrap_or(u32::MAX).to_le_bytes());
        bytes.extend_from_slice(b"WEBP");
        bytes.extend((0..body).map(|i| (i % 251) as u8));
        bytes
    }

    // ========================================================================
    // Host behavior
    // ========================================================================

    /// The host's own `updateSaveCapture`
    fn update_save_capture(&mut self) {
        let state = self.state_value();
        let next = match state {
            HostSaveState::Idle => return,
            HostSaveState::Serialize => {
                let quality = self
                    .field_of(self.album, names::QUALITY)
                    .and_then(|q| q.as_u32())
                    .unwrap_or(HOST_DEFAULT_QUALITY);
                self.stage_serialized_result(&Self::host_payload(quality), false);
                self.serialize_job = Some(self.serialize_frames);
                HostSaveState::WaitSerialize
            }
            HostSaveState::WaitSerialize => {
                let completed = self
                    .field_of(self.serialized, COMPLETED)
                    .and_then(|c| c.as_bool())
                    .unwrap_or(false);
                if !completed {
                    return;
                }
                HostSaveState::SaveCapture
            }
            HostSaveState::SaveCapture => {
                let content = self.serialized_content().unwrap_or_default();
                debug!("Host saved a {} byte capture", content.len());
                self.saved.push(content);
                if let Some(album) = self.objects.get_mut(&self.album.0) {
                    album
                        .fields
                        .insert(names::QUALITY.to_string(), HostValue::U32(HOST_DEFAULT_QUALITY));
                }
                HostSaveState::WaitSaveCapture
            }
            other => other.next(),
        };
        self.set_state(next);
    }

    /// Serialization runs as a job of its own, independent of the hooked update
    fn advance_serialize_job(&mut self) {
        match self.serialize_job {
            Some(0) => {
                self.serialize_job = None;
                let serialized = self.serialized;
                if let Some(result) = self.objects.get_mut(&serialized.0) {
                    result
                        .fields
                        .insert(COMPLETED.to_string(), HostValue::Bool(true));
                }
            }
            Some(left) => self.serialize_job = Some(left - 1),
            None => {}
        }
    }

    /// Run one host frame through the agent's hooks
    pub fn run_frame(&mut self, agent: &mut CaptureAgent) {
        self.advance_serialize_job();
        agent.on_update();

        let album = self.album;
        if agent.pre(self, album) == HookAction::ContinueOriginal {
            self.update_save_capture();
        }
        agent.post(self, album);

        agent.on_late_update(self);

        if agent.pre_camera_update() == HookAction::ContinueOriginal {
            self.camera_updates += 1;
        }
        self.scene_time += f64::from(self.global_speed) * FRAME_TIME;

        agent.on_end_rendering();
        self.frame += 1;
    }

    /// Run frames until the save cycle is back at idle, at most `max_frames`.
    /// Each frame waits for a running encode, so the outcome does not depend
    /// on thread timing.
    pub fn run_save_cycle(&mut self, agent: &mut CaptureAgent, max_frames: u32) -> bool {
        for _ in 0..max_frames {
            self.run_frame(agent);
            agent.wait_for_encode();
            if self.state_value() == HostSaveState::Idle {
                return true;
            }
        }
        false
    }
}

impl HostAccessor for SimulatedHost {
    fn singleton(&mut self, type_name: &str) -> Result<ObjectRef> {
        if type_name == names::ALBUM_MANAGER {
            Ok(self.album)
        } else {
            Err(CaptureError::HostField(format!("no singleton {type_name}")))
        }
    }

    fn field(&mut self, obj: ObjectRef, name: &str) -> Result<HostValue> {
        self.object(obj)?
            .fields
            .get(name)
            .copied()
            .ok_or_else(|| CaptureError::HostField(format!("no field {name} on object {}", obj.0)))
    }

    fn set_field(&mut self, obj: ObjectRef, name: &str, value: HostValue) -> Result<()> {
        let object = self.object(obj)?;
        match object.fields.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(CaptureError::HostField(format!(
                "no field {name} on object {}",
                obj.0
            ))),
        }
    }

    fn call(&mut self, obj: ObjectRef, method: &str, args: &[HostValue]) -> Result<HostValue> {
        let index = |args: &[HostValue]| {
            args.first()
                .and_then(HostValue::as_i32)
                .and_then(|i| usize::try_from(i).ok())
                .ok_or_else(|| CaptureError::HostField(format!("{method}: bad index {args:?}")))
        };

        match method {
            names::GET_LENGTH => {
                let len = self.array(obj)?.len();
                Ok(HostValue::I32(i32::try_from(len).unwrap_or(i32::MAX)))
            }
            names::GET => {
                let i = index(args)?;
                self.array(obj)?
                    .get(i)
                    .map(|b| HostValue::U8(*b))
                    .ok_or_else(|| CaptureError::HostField(format!("index {i} out of range")))
            }
            names::SET => {
                let i = index(args)?;
                let value = args
                    .get(1)
                    .and_then(HostValue::as_u8)
                    .ok_or_else(|| CaptureError::HostField(format!("Set: bad value {args:?}")))?;
                let slot = self
                    .array(obj)?
                    .get_mut(i)
                    .ok_or_else(|| CaptureError::HostField(format!("index {i} out of range")))?;
                *slot = value;
                Ok(HostValue::Unit)
            }
            names::GET_CONTENT => self.field(obj, names::CONTENT),
            names::GET_COMPLETED => self.field(obj, COMPLETED),
            _ => Err(CaptureError::HostField(format!("no method {method}"))),
        }
    }

    fn call_static(&mut self, type_name: &str, method: &str, args: &[HostValue]) -> Result<HostValue> {
        match (type_name, method) {
            (names::APPLICATION, names::GET_GLOBAL_SPEED) => Ok(HostValue::F32(self.global_speed)),
            (names::APPLICATION, names::SET_GLOBAL_SPEED) => {
                self.global_speed = args
                    .first()
                    .and_then(HostValue::as_f32)
                    .ok_or_else(|| CaptureError::HostField(format!("{method}: bad speed {args:?}")))?;
                Ok(HostValue::Unit)
            }
            _ => Err(CaptureError::HostField(format!("no static {type_name}.{method}"))),
        }
    }

    fn create_byte_array(&mut self, len: usize) -> Result<ObjectRef> {
        Ok(self.alloc(SimObject {
            fields: HashMap::new(),
            bytes: Some(vec![0; len]),
        }))
    }
}

/// Host hook that lets the original run untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughHook;

impl HostHook for PassthroughHook {
    fn pre(&mut self, _host: &mut dyn HostAccessor, _this: ObjectRef) -> HookAction {
        HookAction::ContinueOriginal
    }

    fn post(&mut self, _host: &mut dyn HostAccessor, _this: ObjectRef) {}
}

impl SimulatedHost {
    /// Advance the save state machine once with `hook` around it
    pub fn tick_save_capture(&mut self, hook: &mut dyn HostHook) {
        self.advance_serialize_job();
        let album = self.album;
        if hook.pre(self, album) == HookAction::ContinueOriginal {
            self.update_save_capture();
        }
        hook.post(self, album);
    }
}
