//! Meshrun: run scripts across a directory of local and remote machines.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Registered machines and their credentials.
pub mod resource;
// The in-memory resource directory.
pub mod directory;
// Execution requests.
pub mod descriptor;
// Selector resolution.
pub mod resolver;
// Dispatch seam and the default shell/SSH dispatcher.
pub mod dispatch;
// Local process execution.
pub mod local;
// SSH session wrapper.
pub mod session;
// Per-resource lanes and lock files.
pub mod sync;
// Execution results.
pub mod result;
// Concurrent execution engine.
pub mod engine;
// Result aggregation.
pub mod aggregate;
// Terminal output.
pub mod render;
// Resource file persistence.
pub mod store;
// Error handling.
pub mod error;

pub use aggregate::{aggregate, Report, ReportEntry, Summary};
pub use config::Config;
pub use descriptor::{ExecutionDescriptor, Script, Selector};
pub use directory::ResourceDirectory;
pub use dispatch::{CommandOutput, Dispatch, HostKeyPolicy, ShellDispatcher, SshOptions};
pub use engine::Engine;
pub use error::{ErrorKind, MeshError};
pub use render::Renderer;
pub use resolver::{Cardinality, TargetResolver};
pub use resource::{AuthMaterial, ConnectionSpec, Credentials, Kind, Resource, Target};
pub use result::{ExecutionResult, Status};
pub use store::ResourceStore;
