//! Top-level helper invoked by a downstream project's configure step:
//! picks defaults, ensures prebuilt bundles, generates machine configs, and
//! invokes the external build driver's `setup`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs_err as fs;
use serde::{Deserialize, Serialize};

use crate::build_driver::BuildDriver;
use crate::env_init;
use crate::error::RelkitError;
use crate::machine_config::{self, MachineConfig};
use crate::machine_spec::MachineSpec;
use crate::params::{Bundle, Parameters};
use crate::progress::Progress;
use crate::sync::Synchronizer;

/// High-level configure request from the downstream project.
pub struct ConfigureRequest {
    pub prefix: PathBuf,
    pub build_machine: MachineSpec,
    pub host_machine: MachineSpec,
    pub allowed_prebuilds: Vec<Bundle>,
    pub default_library: String,
    pub strip: bool,
    pub extra_options: Vec<String>,
}

/// Persisted build-state record, named `relkit-env.dat` on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildState {
    pub meson_mode: String,
    pub build_cfg_path: PathBuf,
    pub host_cfg_path: Option<PathBuf>,
    pub allowed_prebuilds: Vec<String>,
    pub deps_dir: PathBuf,
}

pub struct Configurator<'a> {
    pub synchronizer: Synchronizer,
    pub build_driver: &'a dyn BuildDriver,
    pub bootstrap_version: String,
}

impl<'a> Configurator<'a> {
    pub fn new(synchronizer: Synchronizer, build_driver: &'a dyn BuildDriver, bootstrap_version: impl Into<String>) -> Self {
        Configurator {
            synchronizer,
            build_driver,
            bootstrap_version: bootstrap_version.into(),
        }
    }

    pub fn configure(
        &self,
        params: &Parameters,
        request: &ConfigureRequest,
        deps_dir: &Path,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<BuildState> {
        let build_machine = request.build_machine.maybe_adapt_to_host(&request.host_machine);

        let mut toolchain_prefix = None;
        let mut host_sdk_prefix = None;
        let mut build_sdk_prefix = None;

        for bundle in &request.allowed_prebuilds {
            let location = deps_dir.join(bundle.name()).join(match bundle {
                Bundle::Toolchain => build_machine.identifier(),
                Bundle::Sdk => request.host_machine.identifier(),
            });
            let version = match bundle {
                Bundle::Toolchain => self.bootstrap_version.clone(),
                Bundle::Sdk => params.deps_version.clone(),
            };
            let machine = match bundle {
                Bundle::Toolchain => &build_machine,
                Bundle::Sdk => &request.host_machine,
            };

            let result = self.synchronizer.sync(*bundle, machine, &location, &version, |p| on_progress(p));
            match result {
                Ok(_) => match bundle {
                    Bundle::Toolchain => toolchain_prefix = Some(location),
                    Bundle::Sdk => host_sdk_prefix = Some(location),
                },
                Err(e) => {
                    if let Some(RelkitError::BundleNotFound { .. }) = e.downcast_ref::<RelkitError>() {
                        let remediation = format!("use --without-prebuilds={}", bundle.name());
                        match bundle {
                            Bundle::Toolchain => bail!(RelkitError::ToolchainNotFoundError {
                                reason: e.to_string(),
                                remediation,
                            }),
                            Bundle::Sdk => bail!(RelkitError::SDKNotFoundError {
                                reason: e.to_string(),
                                remediation,
                            }),
                        }
                    }
                    return Err(e);
                }
            }
        }
        if build_sdk_prefix.is_none() && build_machine == request.host_machine {
            build_sdk_prefix = host_sdk_prefix.clone();
        }

        let environ: HashMap<String, String> = std::env::vars().collect();
        let outdir = request.prefix.join("machine-files");
        let initializer = env_init::for_machine(&request.host_machine);
        let (build_cfg, host_cfg) = machine_config::generate_machine_configs(
            &build_machine,
            &request.host_machine,
            &environ,
            toolchain_prefix.as_deref(),
            build_sdk_prefix.as_deref(),
            host_sdk_prefix.as_deref(),
            &["meson".to_string()],
            &request.default_library,
            &outdir,
            initializer.as_ref(),
        )?;

        self.invoke_setup(request, &host_cfg)?;

        let state = BuildState {
            meson_mode: "internal".to_string(),
            build_cfg_path: build_cfg.machine_file_path.clone(),
            host_cfg_path: if build_machine == request.host_machine {
                None
            } else {
                Some(host_cfg.machine_file_path.clone())
            },
            allowed_prebuilds: request.allowed_prebuilds.iter().map(|b| b.name().to_string()).collect(),
            deps_dir: deps_dir.to_path_buf(),
        };
        self.persist(&request.prefix, &state)?;
        Ok(state)
    }

    fn invoke_setup(&self, request: &ConfigureRequest, host_cfg: &MachineConfig) -> Result<()> {
        let mut args = vec![
            format!("--native-file={}", host_cfg.machine_file_path.display()),
            format!("-Dprefix={}", request.prefix.display()),
            format!("-Ddefault_library={}", request.default_library),
        ];
        args.extend(request.host_machine.meson_optimization_options());
        if request.strip {
            args.push("-Dstrip=true".to_string());
        }
        args.extend(request.extra_options.iter().cloned());

        let env = host_cfg.make_merged_environment(&std::env::vars().collect());
        self.build_driver.setup(Path::new("."), &request.prefix, &args, &env)
    }

    fn persist(&self, builddir: &Path, state: &BuildState) -> Result<()> {
        fs::create_dir_all(builddir)?;
        let serialized = serde_json::to_vec(state).context("serializing build state")?;
        fs::write(builddir.join("relkit-env.dat"), serialized)
            .with_context(|| format!("writing build state under {}", builddir.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_driver::test_support::CountingBuildDriver;
    use pretty_assertions::assert_eq;

    #[test]
    fn persists_allowed_prebuilds_and_deps_dir() {
        let driver = CountingBuildDriver::default();
        let configurator = Configurator::new(Synchronizer::new("https://example.org/deps"), &driver, "9");
        let dir = tempfile::tempdir().unwrap();

        let state = BuildState {
            meson_mode: "internal".to_string(),
            build_cfg_path: dir.path().join("build.txt"),
            host_cfg_path: None,
            allowed_prebuilds: vec!["sdk".to_string()],
            deps_dir: dir.path().to_path_buf(),
        };
        configurator.persist(dir.path(), &state).unwrap();

        let raw = fs::read(dir.path().join("relkit-env.dat")).unwrap();
        let roundtripped: BuildState = serde_json::from_slice(&raw).unwrap();
        assert_eq!(roundtripped.allowed_prebuilds, vec!["sdk".to_string()]);
        assert_eq!(roundtripped.deps_dir, dir.path());
    }
}
