//! Parameter storage: staged writes become visible only on commit.
//!
//! Three slot flavors exist because their protocol semantics differ: plain
//! values travel as self-describing scalars, strings travel as raw character
//! sequences, and object references travel as handles resolved on each
//! process before the set (a null handle clears the slot instead).

use crate::core::errors::ProtocolError;
use crate::object::SceneObject;
use crate::wire::{ReadStream, WriteStream};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

const VALUE_BOOL: u8 = 1;
const VALUE_INT: u8 = 2;
const VALUE_FLOAT: u8 = 3;
const VALUE_VEC2F: u8 = 4;
const VALUE_VEC3F: u8 = 5;
const VALUE_VEC4F: u8 = 6;
const VALUE_VEC2I: u8 = 7;
const VALUE_VEC3I: u8 = 8;

/// Scalar and small-vector parameter values carried on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Vec2f([f32; 2]),
    Vec3f([f32; 3]),
    Vec4f([f32; 4]),
    Vec2i([i32; 2]),
    Vec3i([i32; 3]),
}

impl ParamValue {
    /// Serialize as a kind byte followed by the payload
    pub fn write(&self, w: &mut WriteStream) {
        match self {
            Self::Bool(v) => {
                w.write_u8(VALUE_BOOL);
                w.write_bool(*v);
            }
            Self::Int(v) => {
                w.write_u8(VALUE_INT);
                w.write_i64(*v);
            }
            Self::Float(v) => {
                w.write_u8(VALUE_FLOAT);
                w.write_f32(*v);
            }
            Self::Vec2f(v) => {
                w.write_u8(VALUE_VEC2F);
                for c in v {
                    w.write_f32(*c);
                }
            }
            Self::Vec3f(v) => {
                w.write_u8(VALUE_VEC3F);
                for c in v {
                    w.write_f32(*c);
                }
            }
            Self::Vec4f(v) => {
                w.write_u8(VALUE_VEC4F);
                for c in v {
                    w.write_f32(*c);
                }
            }
            Self::Vec2i(v) => {
                w.write_u8(VALUE_VEC2I);
                for c in v {
                    w.write_i32(*c);
                }
            }
            Self::Vec3i(v) => {
                w.write_u8(VALUE_VEC3I);
                for c in v {
                    w.write_i32(*c);
                }
            }
        }
    }

    pub fn read(r: &mut ReadStream) -> Result<Self, ProtocolError> {
        match r.read_u8()? {
            VALUE_BOOL => Ok(Self::Bool(r.read_bool()?)),
            VALUE_INT => Ok(Self::Int(r.read_i64()?)),
            VALUE_FLOAT => Ok(Self::Float(r.read_f32()?)),
            VALUE_VEC2F => Ok(Self::Vec2f([r.read_f32()?, r.read_f32()?])),
            VALUE_VEC3F => Ok(Self::Vec3f([r.read_f32()?, r.read_f32()?, r.read_f32()?])),
            VALUE_VEC4F => Ok(Self::Vec4f([
                r.read_f32()?,
                r.read_f32()?,
                r.read_f32()?,
                r.read_f32()?,
            ])),
            VALUE_VEC2I => Ok(Self::Vec2i([r.read_i32()?, r.read_i32()?])),
            VALUE_VEC3I => Ok(Self::Vec3i([r.read_i32()?, r.read_i32()?, r.read_i32()?])),
            other => Err(ProtocolError::malformed(
                "param_value",
                format!("unknown value kind {other}"),
            )),
        }
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Vec2f(_) => "vec2f",
            Self::Vec3f(_) => "vec3f",
            Self::Vec4f(_) => "vec4f",
            Self::Vec2i(_) => "vec2i",
            Self::Vec3i(_) => "vec3i",
        }
    }
}

/// One stored parameter
#[derive(Debug, Clone)]
pub enum ParamSlot {
    Value(ParamValue),
    Text(String),
    Object(Arc<SceneObject>),
}

impl ParamSlot {
    pub fn as_value(&self) -> Option<&ParamValue> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<SceneObject>> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl PartialEq for ParamSlot {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Default)]
struct ParamMaps {
    staged: HashMap<String, ParamSlot>,
    committed: HashMap<String, ParamSlot>,
}

/// Staged/committed parameter maps behind one short-section lock.
/// The dispatch task writes; concurrent render tasks read the committed view.
#[derive(Default)]
pub struct ParamStore {
    inner: RwLock<ParamMaps>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, slot: ParamSlot) {
        self.inner.write().staged.insert(name.to_owned(), slot);
    }

    /// Remove a staged parameter; unknown names are a no-op
    pub fn remove(&self, name: &str) {
        self.inner.write().staged.remove(name);
    }

    /// Snapshot the staged map into the committed view
    pub fn commit(&self) {
        let mut maps = self.inner.write();
        maps.committed = maps.staged.clone();
    }

    pub fn committed(&self, name: &str) -> Option<ParamSlot> {
        self.inner.read().committed.get(name).cloned()
    }

    pub fn staged(&self, name: &str) -> Option<ParamSlot> {
        self.inner.read().staged.get(name).cloned()
    }

    pub fn committed_len(&self) -> usize {
        self.inner.read().committed.len()
    }

    pub fn staged_len(&self) -> usize {
        self.inner.read().staged.len()
    }

    /// Committed object-reference parameters, name sorted. The `Arc` links
    /// here are what keep referenced objects alive transitively while a
    /// render task holds this object.
    pub fn committed_objects(&self) -> Vec<(String, Arc<SceneObject>)> {
        let maps = self.inner.read();
        let mut refs: Vec<_> = maps
            .committed
            .iter()
            .filter_map(|(name, slot)| {
                slot.as_object()
                    .map(|obj| (name.clone(), Arc::clone(obj)))
            })
            .collect();
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        refs
    }
}
