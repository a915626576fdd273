//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                 |
//! |-----------------|----------------------------------|
//! | `run`           | `Run`                            |
//! | `inspect`       | `Identify`, `Compose`, `Report`  |
//! | `config`        | `Config`                         |
//!
//! Handlers return the process exit code; `Err` is reserved for
//! configuration and I/O problems (exit code 1).

pub mod config;
pub mod inspect;
pub mod run;

pub use config::cmd_config;
pub use inspect::{cmd_compose, cmd_identify, cmd_report};
pub use run::cmd_run;
