//! fluid: an agent-facing sandbox lifecycle engine.
//!
//! Clones ephemeral sandboxes from golden VM/container images, runs
//! commands in them over SSH with short-lived certificates, and tears
//! them down without residue. A restricted read-only channel onto the
//! golden images themselves allows diagnosis without cloning.
//!
//! The crate is organized leaves-first:
//! - [`host`]: run commands locally, over SSH, or through a jump host
//! - [`ca`] / [`creds`]: the ephemeral credential plane
//! - [`gate`]: the read-only access plane (validator + restricted shell)
//! - [`store`]: durable sandbox/snapshot/audit state
//! - [`provider`]: the backend abstraction (libvirt, Proxmox LXC,
//!   control-plane)
//! - [`service`]: the orchestrator tying it all together

pub mod ca;
pub mod config;
pub mod creds;
pub mod error;
pub mod gate;
pub mod host;
pub mod model;
pub mod provider;
pub mod service;
pub mod store;

pub use error::{Error, Result};
