//! Release, scheduling policy, module loading, and shutdown commands.

use crate::command::context::CommandCtx;
use crate::command::registry::{CommandRegistry, COMMAND_CATALOG};
use crate::command::{tags, Command};
use crate::core::errors::{BeamlineError, ProtocolError, Result};
use crate::handle::Handle;
use crate::object::load_code;
use crate::wire::{ReadStream, WriteStream};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Drop one table reference to a handle.
///
/// References held by in-flight render tasks are separate from the table
/// count, so the object's storage outlives the table entry until those
/// tasks finish. Workers fail hard on an undefined handle; the coordinator
/// treats it as already-gone.
#[derive(Debug, Default)]
pub struct CommandRelease {
    pub handle: Handle,
}

impl CommandRelease {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Command for CommandRelease {
    fn tag(&self) -> u64 {
        tags::RELEASE
    }

    fn name(&self) -> &'static str {
        "release"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.handle);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.handle = r.read_handle()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        if let Some(object) = ctx.handles().release(self.handle)? {
            trace!(handle = %self.handle, kind = object.kind().label(), "released");
        }
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let _ = ctx.handles().release(self.handle);
        Ok(())
    }
}

/// Select the tile scheduling policy for subsequent renders
#[derive(Debug, Default)]
pub struct SetLoadBalancer {
    pub dynamic: bool,
    pub prealloc_tiles: u32,
}

impl SetLoadBalancer {
    pub fn new(dynamic: bool, prealloc_tiles: u32) -> Self {
        Self {
            dynamic,
            prealloc_tiles,
        }
    }
}

#[async_trait]
impl Command for SetLoadBalancer {
    fn tag(&self) -> u64 {
        tags::SET_LOAD_BALANCER
    }

    fn name(&self) -> &'static str {
        "set_load_balancer"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_bool(self.dynamic);
        w.write_u32(self.prealloc_tiles);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.dynamic = r.read_bool()?;
        self.prealloc_tiles = r.read_u32()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        ctx.scheduler().set(self.dynamic, self.prealloc_tiles);
        debug!(
            dynamic = self.dynamic,
            prealloc_tiles = self.prealloc_tiles,
            "load balancer configured"
        );
        Ok(())
    }

    // the coordinator tracks the same policy to size its own share of
    // frame assembly work
    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        ctx.scheduler().set(self.dynamic, self.prealloc_tiles);
        Ok(())
    }
}

/// Load a named extension module on every process.
///
/// Loading is best-effort: a missing module produces an error code, never
/// a stream abort. Workers surface the code through their error path; the
/// coordinator records it on the command for the caller to read back.
#[derive(Debug, Default)]
pub struct LoadModule {
    pub name: String,
    code: AtomicI32,
}

impl LoadModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: AtomicI32::new(load_code::OK),
        }
    }

    /// Result code recorded by `run_on_coordinator`
    pub fn result_code(&self) -> i32 {
        self.code.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Command for LoadModule {
    fn tag(&self) -> u64 {
        tags::LOAD_MODULE
    }

    fn name(&self) -> &'static str {
        "load_module"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_str(&self.name)
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.name = r.read_str("name")?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let code = ctx.modules().load(&self.name, ctx.catalog());
        if code != load_code::OK {
            return Err(BeamlineError::ModuleLoad {
                name: self.name.clone(),
                code,
            });
        }
        debug!(module = %self.name, "module loaded");
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let code = ctx.modules().load(&self.name, ctx.catalog());
        self.code.store(code, Ordering::Release);
        Ok(())
    }
}

/// Orderly shutdown of the dispatch loop on every process
#[derive(Debug, Default)]
pub struct CommandFinalize;

#[async_trait]
impl Command for CommandFinalize {
    fn tag(&self) -> u64 {
        tags::FINALIZE
    }

    fn name(&self) -> &'static str {
        "finalize"
    }

    fn serialize(&self, _w: &mut WriteStream) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn deserialize(&mut self, _r: &mut ReadStream) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        debug!(role = %ctx.role(), "finalize received");
        ctx.request_shutdown();
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        ctx.request_shutdown();
        Ok(())
    }
}

#[linkme::distributed_slice(COMMAND_CATALOG)]
static REGISTER_LIFECYCLE: fn(&mut CommandRegistry) = register;

fn register(registry: &mut CommandRegistry) {
    registry.register(tags::RELEASE, || Box::new(CommandRelease::default()));
    registry.register(tags::SET_LOAD_BALANCER, || {
        Box::new(SetLoadBalancer::default())
    });
    registry.register(tags::LOAD_MODULE, || Box::new(LoadModule::default()));
    registry.register(tags::FINALIZE, || Box::new(CommandFinalize));
}
