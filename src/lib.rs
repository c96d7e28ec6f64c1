//! # DSM DAQ
//!
//! Application layer over the `dsm-core` sample engine: configuration,
//! logging and the tools behind the `dsm` binary.
//!
//! ## Crate Structure
//!
//! - **`config`**: `DsmConfig`, merged from a TOML file and `DSM_*` environment
//!   variables with `figment`, validated before use.
//! - **`logging`**: `tracing-subscriber` setup (pretty, compact or JSON, `RUST_LOG` aware).
//! - **`dump`**: `DumpClient`, a sample client that lists samples as text.
//! - **`commands`**: `dump_archives` and `sort_archives`, the work behind `dsm dump`
//!   and `dsm sort`.
//!
//! The engine itself lives in two workspace crates, re-exported here:
//! [`dsm_pool`] (samples and their pools) and [`dsm_core`] (channels,
//! framing, distribution, sorting).

pub mod commands;
pub mod config;
pub mod dump;
pub mod logging;

pub use dsm_core;
pub use dsm_pool;
