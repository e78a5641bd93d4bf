//! Configuration for Meshrun.
//!
//! Holds the clap structs for command line arguments and flags. Every flag that names a file
//! can also come from the environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::descriptor::{ExecutionDescriptor, Script, Selector};
use crate::dispatch::{HostKeyPolicy, SshOptions};
use crate::resource::{ConnectionSpec, Kind};

#[derive(Parser)]
#[command(version, about)]
pub struct Config {
    /// Resource file to use
    #[arg(long, global = true, env = "MESHRUN_RESOURCES", default_value = "resources.yaml")]
    pub resources: PathBuf,

    /// Don't color the output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Register a resource, or replace the one with the same name
    Add(AddArgs),
    /// List all registered resources
    List,
    /// Remove a resource
    Remove {
        /// Name of the resource
        name: String,
    },
    /// Run a script on exactly one resource
    Run {
        /// `name`, `name:<name>` or `label:<label>`; a label must match a single resource
        selector: Selector,
        /// Script file, or a command line with --inline
        script: String,
        #[command(flatten)]
        options: RunOptions,
    },
    /// Run a script on every resource the selectors match
    Fanout {
        /// Script file, or a command line with --inline
        script: String,
        /// `name`, `name:<name>` or `label:<label>`
        #[arg(required = true)]
        selectors: Vec<Selector>,
        #[command(flatten)]
        options: RunOptions,
    },
}

#[derive(Args, Clone)]
pub struct AddArgs {
    /// Unique name of the resource
    pub name: String,

    /// Label to attach; repeat for several
    #[arg(long = "label", short)]
    pub labels: Vec<String>,

    /// Local machine or remote host
    #[arg(long, value_enum, default_value_t = Kind::Local)]
    pub kind: Kind,

    /// Host to connect to. Defaults to the name
    #[arg(long)]
    pub address: Option<String>,

    /// SSH port
    #[arg(long)]
    pub port: Option<u16>,

    /// User to log in (remote) or run as (local)
    #[arg(long, short)]
    pub user: Option<String>,

    /// Private key reference for the SSH login
    #[arg(long, short)]
    pub key: Option<String>,

    /// Template parameter as key=value; repeat for several
    #[arg(long = "param", value_parser = parse_param)]
    pub params: Vec<(String, String)>,
}

impl AddArgs {
    pub fn into_spec(self) -> (String, ConnectionSpec) {
        let spec = ConnectionSpec {
            labels: self.labels,
            kind: self.kind,
            address: self.address,
            port: self.port,
            username: self.user,
            key: self.key,
            params: self.params.into_iter().collect::<BTreeMap<_, _>>(),
        };
        (self.name, spec)
    }
}

#[derive(Args)]
pub struct RunOptions {
    /// Treat the script argument as a command line instead of a file
    #[arg(long)]
    pub inline: bool,

    /// Force local or remote execution regardless of the resource kind
    #[arg(long, value_enum)]
    pub kind: Option<Kind>,

    /// Render the script as a handlebars template for each resource
    #[arg(long)]
    pub template: bool,

    /// Maximum number of executions running at once. Unbounded if not given
    #[arg(long, short = 'j')]
    pub max_concurrency: Option<usize>,

    /// Seconds to wait for an SSH connection
    #[arg(long, default_value = "10")]
    pub connect_timeout: u64,

    /// What to do with unknown SSH host keys
    #[arg(long, value_enum, default_value_t = HostKeyPolicy::Add)]
    pub host_key: HostKeyPolicy,
}

impl RunOptions {
    pub fn descriptor(&self, selector: Selector, script: &str) -> ExecutionDescriptor {
        let script = if self.inline {
            Script::Inline(script.to_owned())
        } else {
            Script::Path(PathBuf::from(script))
        };
        let descriptor = ExecutionDescriptor::new(selector, script).templated(self.template);
        match self.kind {
            Some(kind) => descriptor.with_target_kind(kind),
            None => descriptor,
        }
    }

    pub fn ssh(&self) -> SshOptions {
        SshOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            host_keys: self.host_key,
        }
    }
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}
