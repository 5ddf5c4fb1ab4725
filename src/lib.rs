//! DART: a runtime for Partitioned Global Address Space (PGAS) programming.
//!
//! Structured the way this runtime's own teacher structures a kernel: one
//! module per subsystem, a thin [`runtime`] tying their process-wide
//! singletons together, and a public surface that mirrors the underlying
//! `dart_*` C ABI (spec §2, §6) without itself being that ABI — `dart-sys`
//! or a similar `#[no_mangle] extern "C"` shim would sit on top of this
//! crate's [`runtime`]/[`gptr`]/[`rma`]/[`collectives`] functions to expose
//! one.
//!
//! # Layout
//!
//! - [`error`] / [`config`]: the ambient stack every other module leans on —
//!   [`error::DartError`]/[`error::ReturnCode`] for fallible operations,
//!   [`config`] for the `DART_*` environment knobs read once at [`init`].
//! - [`gptr`] / [`dtype`] / [`segment`] / [`team`]: the PGAS memory model
//!   (spec §3, §4.1, §4.2, §4.4).
//! - [`transport`] / [`loopback`] / [`rma`] / [`collectives`] / [`lock`]:
//!   the one-sided communication layer and the library operations built on
//!   it (spec §4.3, §4.9's sibling collectives, §4.10).
//! - [`locality`]: host/NUMA topology discovery (spec §4.5).
//! - [`amsgq`]: the active-message queue and its three interchangeable
//!   back-ends (spec §4.6).
//! - [`task`] / [`depgraph`]: the work-stealing task scheduler and its
//!   dependency-aware submission path (spec §4.7, §4.8, §4.9).
//! - [`runtime`]: process-wide singletons and [`init`]/[`exit`].

pub mod amsgq;
pub mod collectives;
pub mod config;
pub mod depgraph;
pub mod dtype;
pub mod error;
pub mod gptr;
pub mod locality;
pub mod lock;
pub mod loopback;
pub mod rma;
pub mod runtime;
pub mod segment;
pub mod task;
pub mod team;
pub mod transport;

pub use error::{DartError, Result, ReturnCode};
pub use gptr::GlobalPtr;
pub use runtime::{init, Runtime};
pub use team::{TeamId, TEAM_ALL, TEAM_NULL};
