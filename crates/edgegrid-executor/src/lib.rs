//! edgegrid-executor — the only component that touches live infrastructure.
//!
//! Performs the physical side of every decision: swarm membership,
//! cloud instance state changes and container lifecycle, with bounded
//! retries and geo-aware placement.
//!
//! # Architecture
//!
//! ```text
//! Executor
//!   ├── hosts        join (retry 1s, 2s, 3s, …) / leave / start near / free port
//!   ├── containers   launch / replicate / migrate (+ deferred stop) / stop / sync
//!   ├── CloudManager start / stop / terminate with state polling
//!   ├── DeferredTasks cancellable delayed actions keyed by entity id
//!   └── Backends     CommandRunner, CloudProvider, SwarmApi, ContainerRuntime, HostProbe
//! ```
//!
//! The [`cli`] module provides backends that shell out to `bash`/`ssh`,
//! `aws ec2` and `docker`.

pub mod backends;
pub mod cli;
pub mod cloud;
pub mod containers;
pub mod context;
pub mod deferred;
pub mod error;
pub mod executor;
pub mod hosts;

#[cfg(test)]
pub(crate) mod mock;

pub use backends::{CloudProvider, CommandRunner, ContainerRuntime, LaunchRequest, RunningContainer, SwarmApi, SwarmNode};
pub use cli::{AwsCliProvider, AwsLaunchConfig, CommandHostProbe, DockerCliRuntime, DockerCliSwarm, ShellCommandRunner};
pub use cloud::{CloudManager, CloudSettings, TargetState};
pub use containers::{LaunchOptions, dynamic_params, is_app_container, substitute};
pub use context::ExecContext;
pub use deferred::DeferredTasks;
pub use error::{ExecutorError, ExecutorResult};
pub use executor::{Backends, DecisionCallback, Executor, ExecutorSettings, Inventory};
