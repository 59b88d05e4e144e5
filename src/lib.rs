#![deny(missing_docs)]
//! Library form of vmkeep
//!
//! A fleet of QEMU-backed virtual machines ("containers") managed through a
//! single per-user background daemon: boot-and-login handshake over the
//! serial console, a framed request protocol on a loopback socket, an SSH
//! layer for driving booted guests, and a streaming bridge for interactive
//! commands.

/// Container install/export/delete/rename on disk.
pub mod archive;
/// The post-`BEGIN` streaming sub-protocol for `RUN-COMMAND`.
pub mod bridge;
/// Typed client methods for every daemon request.
pub mod client;
/// Container configs and build manifests.
pub mod config;
/// The per-container QEMU runtime.
pub mod container;
/// The lifecycle daemon.
pub mod daemon;
/// Per-user filesystem layout.
pub mod paths;
/// Host port allocation.
pub mod ports;
/// The framed request protocol.
pub mod protocol;
/// SSH/SFTP sessions into booted guests.
pub mod ssh;

mod console;

pub use crate::client::{ClientError, DaemonClient, SshAddress};
pub use crate::config::{Arch, ContainerConfig, ContainerManifest};
pub use crate::container::{Container, ContainerError};
pub use crate::paths::Paths;
