// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Host object access
//!
//! The capture agent never touches host memory directly. Everything it
//! needs from the running application (singletons, fields, methods, managed
//! byte arrays) goes through a [`HostAccessor`], so the same code drives a
//! real reflection bridge or the in-process simulator.

use crate::error::{CaptureError, Result};
use crate::prepare::SimulationClock;
use crate::protocol::{names, HostSaveState};

/// Handle to a host managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub u64);

/// Value crossing the host boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostValue {
    Unit,
    Bool(bool),
    I32(i32),
    U32(u32),
    U8(u8),
    F32(f32),
    Object(Option<ObjectRef>),
}

impl HostValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            HostValue::I32(v) => Some(*v),
            HostValue::U32(v) => i32::try_from(*v).ok(),
            HostValue::U8(v) => Some(i32::from(*v)),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            HostValue::U32(v) => Some(*v),
            HostValue::I32(v) => u32::try_from(*v).ok(),
            HostValue::U8(v) => Some(u32::from(*v)),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            HostValue::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            HostValue::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            HostValue::Object(v) => *v,
            _ => None,
        }
    }
}

/// Reflection access to the host
pub trait HostAccessor {
    /// Look up a managed singleton by type name
    fn singleton(&mut self, type_name: &str) -> Result<ObjectRef>;

    /// Read a field
    fn field(&mut self, obj: ObjectRef, name: &str) -> Result<HostValue>;

    /// Write a field
    fn set_field(&mut self, obj: ObjectRef, name: &str, value: HostValue) -> Result<()>;

    /// Call an instance method
    fn call(&mut self, obj: ObjectRef, method: &str, args: &[HostValue]) -> Result<HostValue>;

    /// Call a static method
    fn call_static(&mut self, type_name: &str, method: &str, args: &[HostValue]) -> Result<HostValue>;

    /// Allocate a managed byte array of `len` zeroed elements
    fn create_byte_array(&mut self, len: usize) -> Result<ObjectRef>;
}

/// What a pre-hook tells the host to do with the hooked method
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    #[default]
    ContinueOriginal,
    SuppressOriginal,
}

impl HookAction {
    /// Suppress if either side wants to
    pub fn combine(self, other: HookAction) -> HookAction {
        if self == HookAction::SuppressOriginal || other == HookAction::SuppressOriginal {
            HookAction::SuppressOriginal
        } else {
            HookAction::ContinueOriginal
        }
    }
}

/// Hook installed around a host method
pub trait HostHook {
    /// Runs before the original; may suppress it
    fn pre(&mut self, host: &mut dyn HostAccessor, this: ObjectRef) -> HookAction;

    /// Runs after the original (or after it was suppressed)
    fn post(&mut self, host: &mut dyn HostAccessor, this: ObjectRef);
}

// ============================================================================
// Typed helpers
// ============================================================================

fn mismatch(obj: ObjectRef, name: &str, value: HostValue) -> CaptureError {
    CaptureError::HostField(format!("{name} on object {} has unexpected value {value:?}", obj.0))
}

pub fn read_bool(host: &mut dyn HostAccessor, obj: ObjectRef, name: &str) -> Result<bool> {
    let value = host.field(obj, name)?;
    value.as_bool().ok_or_else(|| mismatch(obj, name, value))
}

pub fn read_i32(host: &mut dyn HostAccessor, obj: ObjectRef, name: &str) -> Result<i32> {
    let value = host.field(obj, name)?;
    value.as_i32().ok_or_else(|| mismatch(obj, name, value))
}

pub fn read_u32(host: &mut dyn HostAccessor, obj: ObjectRef, name: &str) -> Result<u32> {
    let value = host.field(obj, name)?;
    value.as_u32().ok_or_else(|| mismatch(obj, name, value))
}

pub fn read_object(host: &mut dyn HostAccessor, obj: ObjectRef, name: &str) -> Result<ObjectRef> {
    let value = host.field(obj, name)?;
    value.as_object().ok_or_else(|| mismatch(obj, name, value))
}

/// Current `_SaveCaptureState` of the album manager
pub fn save_state(host: &mut dyn HostAccessor, album: ObjectRef) -> Result<HostSaveState> {
    let raw = read_i32(host, album, names::SAVE_CAPTURE_STATE)?;
    HostSaveState::try_from(raw)
        .map_err(|e| CaptureError::HostField(format!("{}: {e} ({raw})", names::SAVE_CAPTURE_STATE)))
}

/// Copy a managed byte array element by element
pub fn read_byte_array(host: &mut dyn HostAccessor, array: ObjectRef) -> Result<Vec<u8>> {
    let len = host.call(array, names::GET_LENGTH, &[])?;
    let len = len
        .as_i32()
        .and_then(|l| usize::try_from(l).ok())
        .ok_or_else(|| mismatch(array, names::GET_LENGTH, len))?;

    let mut bytes = Vec::with_capacity(len);
    for i in 0..len {
        let index = HostValue::I32(i32::try_from(i).unwrap_or(i32::MAX));
        let value = host.call(array, names::GET, &[index])?;
        bytes.push(value.as_u8().ok_or_else(|| mismatch(array, names::GET, value))?);
    }
    Ok(bytes)
}

/// Allocate a managed byte array of exactly `bytes.len()` and fill it
pub fn write_byte_array(host: &mut dyn HostAccessor, bytes: &[u8]) -> Result<ObjectRef> {
    let array = host.create_byte_array(bytes.len())?;
    for (i, byte) in bytes.iter().enumerate() {
        let index = i32::try_from(i)
            .map_err(|_| CaptureError::HostField(format!("byte array index {i} out of range")))?;
        host.call(array, names::SET, &[HostValue::I32(index), HostValue::U8(*byte)])?;
    }
    Ok(array)
}

/// [`SimulationClock`] backed by the host application's global speed
pub struct HostClock<'a> {
    host: &'a mut dyn HostAccessor,
}

impl<'a> HostClock<'a> {
    pub fn new(host: &'a mut dyn HostAccessor) -> Self {
        Self { host }
    }
}

impl SimulationClock for HostClock<'_> {
    fn global_speed(&mut self) -> Result<f32> {
        let value = self
            .host
            .call_static(names::APPLICATION, names::GET_GLOBAL_SPEED, &[])?;
        value.as_f32().ok_or_else(|| {
            CaptureError::HostField(format!("{} returned {value:?}", names::GET_GLOBAL_SPEED))
        })
    }

    fn set_global_speed(&mut self, speed: f32) -> Result<()> {
        self.host
            .call_static(names::APPLICATION, names::SET_GLOBAL_SPEED, &[HostValue::F32(speed)])?;
        Ok(())
    }
}
