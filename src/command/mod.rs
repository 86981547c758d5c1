//! The ordered command protocol.
//!
//! Every public operation becomes one command value: the coordinator
//! serializes it, broadcasts the frame to all workers in submission order,
//! then runs the coordinator-side half locally. Workers decode and run
//! commands strictly sequentially, so identical replay of the same stream
//! keeps every process's object graph equivalent without shared memory.

pub mod construct;
pub mod context;
pub mod lifecycle;
pub mod mutate;
pub mod registry;
pub mod render;

pub use self::context::{CommandCtx, Role};
pub use self::registry::{CommandFactory, CommandRegistry, COMMAND_CATALOG};

use crate::core::errors::{ProtocolError, Result};
use crate::wire::{ReadStream, WriteStream};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Stable wire tags, one per command. Values are part of the protocol and
/// never reused.
pub mod tags {
    pub const NEW_OBJECT: u64 = 1;
    pub const NEW_MATERIAL: u64 = 2;
    pub const NEW_INSTANCE: u64 = 3;
    pub const NEW_GEOMETRIC_MODEL: u64 = 4;
    pub const NEW_VOLUMETRIC_MODEL: u64 = 5;
    pub const NEW_DATA: u64 = 6;
    pub const SET_PARAM: u64 = 7;
    pub const SET_PARAM_STRING: u64 = 8;
    pub const SET_PARAM_OBJECT: u64 = 9;
    pub const REMOVE_PARAM: u64 = 10;
    pub const COMMIT_OBJECT: u64 = 11;
    pub const RELEASE: u64 = 12;
    pub const SET_LOAD_BALANCER: u64 = 13;
    pub const LOAD_MODULE: u64 = 14;
    pub const FINALIZE: u64 = 15;
    pub const CREATE_FRAME_BUFFER: u64 = 16;
    pub const RESET_ACCUMULATION: u64 = 17;
    pub const RENDER_FRAME_ASYNC: u64 = 18;
    pub const PICK: u64 = 19;
}

/// One replayable protocol operation.
///
/// `run` executes on every worker; `run_on_coordinator` executes on the
/// coordinator after the command has been broadcast. Both default to
/// no-ops so commands implement only the sides that do work for them.
#[async_trait]
pub trait Command: Send + Sync + fmt::Debug {
    fn tag(&self) -> u64;

    /// Lowercase name used in logs and diagnostics
    fn name(&self) -> &'static str;

    /// Append the body to the stream, in declared field order
    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError>;

    /// Read the body back from a stream positioned just past the tag
    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError>;

    async fn run(&self, _ctx: &Arc<CommandCtx>) -> Result<()> {
        Ok(())
    }

    async fn run_on_coordinator(&self, _ctx: &Arc<CommandCtx>) -> Result<()> {
        Ok(())
    }
}

/// Encode one command as a self-contained wire frame: `[tag][body]`
pub fn encode_command(command: &dyn Command) -> Result<Bytes, ProtocolError> {
    let mut w = WriteStream::new();
    w.write_u64(command.tag());
    command.serialize(&mut w)?;
    Ok(w.into_bytes())
}
