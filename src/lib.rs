//! Release-engineering core for a native toolchain/SDK bundling pipeline.
//!
//! Produces two kinds of prebuilt archives — a **toolchain** bundle
//! (host-side build tools) and an **SDK** bundle (libraries and headers for
//! a target platform) — and deploys them into a source tree so a
//! downstream project can configure and build against pinned dependencies
//! without rebuilding them from source.
//!
//! The crate is organized around the subsystems this pipeline is built
//! from:
//!
//! - [`machine_spec`] — canonical `{os, arch, config, triplet}` descriptor.
//! - [`params`] — the declarative dependency-description document.
//! - [`resolver`] — topological resolution over a package subset.
//! - [`sync`] — the bundle synchronizer (fetch/verify/extract/patch).
//! - [`machine_config`] and [`env_init`] — machine-configuration generation.
//! - [`build_driver`] — the external build-system contract.
//! - [`builder`] — the cross-build orchestrator.
//! - [`configurator`] — the downstream-facing `configure` entry point.
//! - [`progress`] and [`error`] — the structured progress/error surface.
//!
//! Everything here is synchronous and single-threaded; long-running
//! operations block on child processes or HTTP I/O rather than spawning
//! their own concurrency.

#![deny(unsafe_code)]

pub mod build_driver;
pub mod builder;
pub mod configurator;
pub mod env_init;
pub mod error;
pub mod machine_config;
pub mod machine_spec;
pub mod params;
pub mod progress;
pub mod resolver;
pub mod sync;

pub use build_driver::{BuildDriver, ProcessBuildDriver};
pub use builder::{BuildRequest, Builder};
pub use configurator::{BuildState, ConfigureRequest, Configurator};
pub use error::RelkitError;
pub use machine_config::{generate_machine_configs, MachineConfig};
pub use machine_spec::MachineSpec;
pub use params::{Bundle, Package, Parameters};
pub use progress::{Progress, ProgressSink};
pub use sync::{SourceState, Synchronizer};
