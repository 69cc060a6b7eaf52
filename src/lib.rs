#![warn(missing_docs)]
//! Host-side device-plane core for exposing locally-attached USB devices over
//! the network using the USB/IP wire protocol.
//!
//! This crate is the subsystem that sits between the host operating system's
//! USB registry and the USB/IP wire-protocol server: it discovers devices,
//! keeps a live model of the attached-device set, opens and owns USB
//! interfaces for devices the embedding process has claimed, and multiplexes
//! control/bulk/interrupt/isochronous transfers against them. It does not
//! encode or decode USB/IP frames, run a TCP server, or decide who may claim
//! a device — those are the responsibility of collaborators the embedding
//! process wires in.
//!
//! ## Five components
//!
//! - [`registry`] (C1) — capability boundary over the host USB registry.
//!   [`registry::iokit::IoKitRegistry`] is the macOS production backend;
//!   [`registry::fake::FakeRegistry`] is a scripted double used throughout
//!   this crate's own tests.
//! - [`mapper`] (C2) — translates a raw registry return code plus an
//!   [`error::ErrorContext`] into the structured [`error::Error`] taxonomy
//!   and a [`error::RecoveryHint`].
//! - [`discovery`] (C3) — [`discovery::Discovery`] enumerates devices into
//!   [`device::UsbDevice`] records, caches them with a short TTL, and runs a
//!   background notification loop.
//! - [`monitor`] (C4) — [`monitor::DeviceMonitor`] wraps [`discovery::Discovery`]
//!   and deduplicates its raw callbacks into a higher-level, exactly-once
//!   [`monitor::DeviceEvent`] stream.
//! - [`communicator`] (C5) — [`communicator::Communicator`] opens/closes
//!   per-device interfaces and executes the four transfer types against
//!   them, enforcing a [`claim::ClaimOracle`] at the boundary.
//!
//! ## Logging
//!
//! This crate uses the [`log`](https://docs.rs/log) crate for diagnostics.
//! Configure a `log` backend such as
//! [`env_logger`](https://docs.rs/env_logger) in the embedding process and
//! enable output for this crate (e.g. `RUST_LOG=usbip_device_core=debug`) to
//! see enumeration, retry, and notification activity.
//!
//! ## Platform support
//!
//! The production [`registry::iokit`] backend is macOS-only (`cfg(target_os
//! = "macos")`), built on IOKit via `io-kit-sys`/`core-foundation`. On other
//! platforms, or in tests on any platform, construct [`discovery::Discovery`]
//! and [`communicator::Communicator`] over [`registry::fake::FakeRegistry`]
//! and [`transfer::fake::FakeInterfaceFactory`] instead.

pub mod claim;
pub mod clock;
pub mod communicator;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod mapper;
pub mod monitor;
pub mod registry;
pub mod retry;
pub mod transfer;
