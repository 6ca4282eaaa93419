//! Pluggable, platform-specific compiler/SDK auto-detection, behind a
//! fixed interface.

use std::path::Path;

use anyhow::{bail, Result};
use indexmap::IndexMap;

use crate::machine_config::Config;
use crate::machine_spec::MachineSpec;

/// Fills in compilers, common flags, and library-path constants for one
/// machine, given `(machine, sdk_prefix, build_machine, is_cross, environ,
/// call_meson, config)`. May mutate `environ` and the writable
/// `config` sections; `binpath` mutation happens at the call site since the
/// generator owns that vector.
pub trait EnvironmentInitializer {
    fn initialize(
        &self,
        machine: &MachineSpec,
        sdk_prefix: Option<&Path>,
        build_machine: &MachineSpec,
        is_cross: bool,
        environ: &mut IndexMap<String, String>,
        call_meson: &[String],
        config: &mut Config<'_>,
    ) -> Result<()>;
}

/// Common-case initializer: wires the `call_meson` wrapper as the `meson`
/// binary and leaves compiler auto-detection to the build driver's own
/// ambient-PATH discovery.
pub struct Generic;

impl EnvironmentInitializer for Generic {
    fn initialize(
        &self,
        _machine: &MachineSpec,
        _sdk_prefix: Option<&Path>,
        _build_machine: &MachineSpec,
        _is_cross: bool,
        _environ: &mut IndexMap<String, String>,
        call_meson: &[String],
        config: &mut Config<'_>,
    ) -> Result<()> {
        if !call_meson.is_empty() {
            config.binaries.insert("meson".to_string(), call_meson.to_vec());
        }
        Ok(())
    }
}

/// Apple SDK auto-detection (Xcode toolchain discovery, `-isysroot`,
/// platform-specific deployment-target flags). Explicitly out of scope
/// beyond its interface: a full port would shell out to `xcrun` the way
/// `original_source/env_apple.py` does.
pub struct Apple;

impl EnvironmentInitializer for Apple {
    fn initialize(
        &self,
        _machine: &MachineSpec,
        _sdk_prefix: Option<&Path>,
        _build_machine: &MachineSpec,
        _is_cross: bool,
        _environ: &mut IndexMap<String, String>,
        _call_meson: &[String],
        _config: &mut Config<'_>,
    ) -> Result<()> {
        bail!("Apple toolchain auto-detection is not built in; supply a custom EnvironmentInitializer")
    }
}

/// Android NDK auto-detection. Same scoping as [`Apple`].
pub struct Android;

impl EnvironmentInitializer for Android {
    fn initialize(
        &self,
        _machine: &MachineSpec,
        _sdk_prefix: Option<&Path>,
        _build_machine: &MachineSpec,
        _is_cross: bool,
        _environ: &mut IndexMap<String, String>,
        _call_meson: &[String],
        _config: &mut Config<'_>,
    ) -> Result<()> {
        bail!("Android NDK auto-detection is not built in; supply a custom EnvironmentInitializer")
    }
}

/// Pick an initializer for `machine` among the built-in ones.
pub fn for_machine(machine: &MachineSpec) -> Box<dyn EnvironmentInitializer> {
    match machine.os.as_str() {
        "macos" | "ios" | "watchos" | "tvos" => Box::new(Apple),
        "android" => Box::new(Android),
        _ => Box::new(Generic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_registers_meson_binary() {
        let mut constants = IndexMap::new();
        let mut binaries = IndexMap::new();
        let mut built_in_options = IndexMap::new();
        let mut properties = IndexMap::new();
        let mut config = Config {
            constants: &mut constants,
            binaries: &mut binaries,
            built_in_options: &mut built_in_options,
            properties: &mut properties,
        };
        let mut environ = IndexMap::new();
        let machine = MachineSpec::new("linux", "x86_64", None);

        Generic
            .initialize(
                &machine,
                None,
                &machine,
                false,
                &mut environ,
                &["meson".to_string()],
                &mut config,
            )
            .unwrap();

        assert_eq!(binaries.get("meson"), Some(&vec!["meson".to_string()]));
    }

    #[test]
    fn for_machine_picks_apple_for_macos() {
        let machine = MachineSpec::new("macos", "arm64", None);
        let initializer = for_machine(&machine);
        let mut constants = IndexMap::new();
        let mut binaries = IndexMap::new();
        let mut built_in_options = IndexMap::new();
        let mut properties = IndexMap::new();
        let mut config = Config {
            constants: &mut constants,
            binaries: &mut binaries,
            built_in_options: &mut built_in_options,
            properties: &mut properties,
        };
        let mut environ = IndexMap::new();
        let result = initializer.initialize(&machine, None, &machine, false, &mut environ, &[], &mut config);
        assert!(result.is_err(), "Apple initializer is an intentional stub");
    }
}
