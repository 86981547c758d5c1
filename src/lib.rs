// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

// Protocol layers, bottom up
pub mod wire; // ordered field codec for command frames
pub mod handle; // distributed handle table
pub mod object; // scene object model and type catalog
pub mod render; // tile scheduling, shading, reports
pub mod command; // the command catalog itself
pub mod dispatch; // stream production and consumption

// Re-exports for convenience
pub use self::core::config::ClusterConfig;
pub use self::core::errors::{BeamlineError, HandleError, ProtocolError, Result};
pub use command::{Command, CommandCtx, CommandRegistry, Role};
pub use dispatch::{Coordinator, LocalCluster};
pub use handle::{Handle, HandleTable};
pub use object::{channel, ColorFormat, DataFormat, ObjectKind, ParamValue};
pub use render::PickResult;
