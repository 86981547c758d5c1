//! Per-process execution context handed to every command.
//!
//! One context exists per process in the cluster. Commands receive it as a
//! shared reference so long-running work (render jobs) can carry clones of
//! its pieces into spawned tasks.

use crate::core::config::ClusterConfig;
use crate::core::errors::{HandleError, Result};
use crate::handle::{Handle, HandleTable};
use crate::object::{ModuleRegistry, ObjectKind, SceneObject, TaskGuards, TypeCatalog};
use crate::render::{
    FrameRoutes, PickGather, PreviewKernel, RenderKernel, ReplySink, SchedulePolicy,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Which half of the protocol this process executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Worker { rank: u32 },
}

impl Role {
    pub fn is_coordinator(self) -> bool {
        matches!(self, Self::Coordinator)
    }

    pub fn worker_rank(self) -> Option<u32> {
        match self {
            Self::Coordinator => None,
            Self::Worker { rank } => Some(rank),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator => write!(f, "coordinator"),
            Self::Worker { rank } => write!(f, "worker-{rank}"),
        }
    }
}

/// Mutable tile-scheduling policy, updated in place by the load balancer
/// command so in-flight contexts see the change on the next frame.
pub struct SchedulerState {
    dynamic: AtomicBool,
    prealloc_tiles: AtomicU32,
}

impl SchedulerState {
    fn new(policy: SchedulePolicy) -> Self {
        Self {
            dynamic: AtomicBool::new(policy.dynamic),
            prealloc_tiles: AtomicU32::new(policy.prealloc_tiles),
        }
    }

    pub fn set(&self, dynamic: bool, prealloc_tiles: u32) {
        self.dynamic.store(dynamic, Ordering::Release);
        self.prealloc_tiles
            .store(prealloc_tiles.max(1), Ordering::Release);
    }

    pub fn policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            dynamic: self.dynamic.load(Ordering::Acquire),
            prealloc_tiles: self.prealloc_tiles.load(Ordering::Acquire),
        }
    }
}

/// Everything a command may touch while executing on this process
pub struct CommandCtx {
    role: Role,
    workers: u32,
    handles: HandleTable,
    catalog: TypeCatalog,
    modules: ModuleRegistry,
    tasks: Arc<TaskGuards>,
    scheduler: SchedulerState,
    shading_tasks: usize,
    kernel: Arc<dyn RenderKernel>,
    reply: Arc<dyn ReplySink>,
    frame_routes: Option<Arc<dyn FrameRoutes>>,
    pick_gather: Option<PickGather>,
    shutdown: AtomicBool,
}

impl CommandCtx {
    fn build(role: Role, workers: u32, config: &ClusterConfig, reply: Arc<dyn ReplySink>) -> Self {
        Self {
            role,
            workers: workers.max(1),
            handles: HandleTable::new(),
            catalog: TypeCatalog::with_builtin_types(),
            modules: ModuleRegistry::with_builtin_modules(),
            tasks: Arc::new(TaskGuards::new()),
            scheduler: SchedulerState::new(SchedulePolicy {
                dynamic: config.dynamic_load_balancer,
                prealloc_tiles: config.prealloc_tiles,
            }),
            shading_tasks: config.shading_tasks.max(1),
            kernel: Arc::new(PreviewKernel),
            reply,
            frame_routes: None,
            pick_gather: None,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn worker(
        rank: u32,
        workers: u32,
        config: &ClusterConfig,
        reply: Arc<dyn ReplySink>,
    ) -> Self {
        Self::build(Role::Worker { rank }, workers, config, reply)
    }

    /// Coordinator context; frame routing and pick gathering are attached
    /// by the dispatch layer once the fabric channels exist.
    pub fn coordinator(workers: u32, config: &ClusterConfig, reply: Arc<dyn ReplySink>) -> Self {
        Self::build(Role::Coordinator, workers, config, reply)
    }

    pub fn with_frame_routes(mut self, routes: Arc<dyn FrameRoutes>) -> Self {
        self.frame_routes = Some(routes);
        self
    }

    pub fn with_pick_gather(mut self, gather: PickGather) -> Self {
        self.pick_gather = Some(gather);
        self
    }

    pub fn with_kernel(mut self, kernel: Arc<dyn RenderKernel>) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn workers(&self) -> u32 {
        self.workers
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn tasks(&self) -> &Arc<TaskGuards> {
        &self.tasks
    }

    pub fn scheduler(&self) -> &SchedulerState {
        &self.scheduler
    }

    pub fn shading_tasks(&self) -> usize {
        self.shading_tasks
    }

    pub fn kernel(&self) -> Arc<dyn RenderKernel> {
        Arc::clone(&self.kernel)
    }

    pub fn reply(&self) -> Arc<dyn ReplySink> {
        Arc::clone(&self.reply)
    }

    pub fn frame_routes(&self) -> Option<&Arc<dyn FrameRoutes>> {
        self.frame_routes.as_ref()
    }

    pub fn pick_gather(&self) -> Option<&PickGather> {
        self.pick_gather.as_ref()
    }

    /// Resolve a handle and require a specific object kind
    pub fn resolve_kind(&self, handle: Handle, kind: ObjectKind) -> Result<Arc<SceneObject>> {
        let object = self.handles.lookup(handle)?;
        if object.kind() != kind {
            return Err(HandleError::KindMismatch {
                handle,
                expected: kind.label(),
                actual: object.kind().label(),
            }
            .into());
        }
        Ok(object)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
