//! # srsmicro
//!
//! Instrument coordination for a scanning stimulated Raman microscope: an
//! InSight femtosecond laser and a Newport delay stage on serial lines, and a
//! Zurich Instruments lock-in behind its data server.
//!
//! ## Crate Structure
//!
//! - **`adapters`**: the [`Transport`](adapters::Transport) trait and its serial,
//!   data-server and scripted implementations.
//! - **`config`**: layered settings (defaults, TOML file, `SRSMICRO_*`
//!   environment). See [`config::Settings`].
//! - **`coordinator`**: owns the drivers and the poller, routes
//!   `(device, parameter, value)` commands and runs startup and shutdown.
//! - **`error`**: the crate-wide [`DaqError`](error::DaqError).
//! - **`instrument`**: the [`Device`](instrument::Device) contract, condition
//!   maps, device events and the three drivers.
//! - **`labone`**: the lock-in data server API surface plus an in-process
//!   simulation.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`poller`**: the background status poller.

pub mod adapters;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod instrument;
pub mod labone;
pub mod logging;
pub mod poller;
