//! vsbmc: a virtual BMC fleet manager for vSphere
//!
//! Exposes IPMI-over-LAN endpoints on behalf of virtual machines hosted by
//! a vSphere/ESXi hypervisor. Each virtual BMC listens on its own UDP
//! socket, authenticates IPMI clients (including vCenter Server), and
//! translates chassis power commands into vSphere power operations.
//!
//! # Architecture
//!
//! - [`manager`]: the supervisor daemon. Owns the configuration
//!   directory, serves the CLI over a local RPC socket, and reconciles
//!   per-VM listener child processes against the desired state.
//! - [`bmc`]: the listener, a single-threaded RMCP/ASF/IPMI protocol
//!   engine bound to one UDP socket per virtual machine.
//! - [`vsphere`]: the hypervisor adapter consumed by listeners, with a
//!   [`vsphere::HypervisorClient`] trait at the seam.
//! - [`control`]: the length-framed JSON request/reply protocol between
//!   the `vsbmc` CLI and the supervisor.
//!
//! Wire formats for the IPMI side live in the `vsbmc-protocol` crate.

pub mod bmc;
pub mod config;
pub mod control;
pub mod error;
pub mod manager;
pub mod vsphere;

pub use error::{Error, Result};
