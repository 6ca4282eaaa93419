//! Contract for the external build system: a black-box process invoked
//! with an argument vector, a working directory, and an environment. Only
//! `setup`, `install`, `compile`, `test`, and `introspect --installed` are
//! ever called.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use crate::error::RelkitError;

/// Abstracts "the external build driver" so the builder can be tested
/// against a fake without shelling out.
pub trait BuildDriver {
    fn setup(&self, source_dir: &Path, build_dir: &Path, args: &[String], env: &HashMap<String, String>) -> Result<()>;
    fn install(&self, build_dir: &Path, env: &HashMap<String, String>) -> Result<()>;
    fn compile(&self, build_dir: &Path, env: &HashMap<String, String>) -> Result<()>;
    fn test(&self, build_dir: &Path, env: &HashMap<String, String>) -> Result<()>;
    /// Returns relative-to-prefix install paths.
    fn introspect_installed(&self, build_dir: &Path, prefix: &Path, env: &HashMap<String, String>) -> Result<Vec<String>>;
}

/// Shells out to a configurable binary (default `meson`).
pub struct ProcessBuildDriver {
    pub binary: String,
}

impl ProcessBuildDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        ProcessBuildDriver { binary: binary.into() }
    }

    fn run(&self, args: &[String], cwd: &Path, env: &HashMap<String, String>) -> Result<std::process::Output> {
        let mut full_argv = vec![self.binary.clone()];
        full_argv.extend(args.iter().cloned());
        debug!(argv = %full_argv.join(" "), cwd = %cwd.display(), "invoking build driver");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(cwd)
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd
            .output()
            .with_context(|| format!("spawning {}", self.binary))?;

        if !output.status.success() {
            bail!(RelkitError::from_process_output(&full_argv, &output));
        }
        Ok(output)
    }
}

impl BuildDriver for ProcessBuildDriver {
    fn setup(&self, source_dir: &Path, build_dir: &Path, args: &[String], env: &HashMap<String, String>) -> Result<()> {
        let mut full = vec!["setup".to_string()];
        full.extend(args.iter().cloned());
        full.push(build_dir.to_string_lossy().into_owned());
        full.push(source_dir.to_string_lossy().into_owned());
        self.run(&full, source_dir, env)?;
        Ok(())
    }

    fn install(&self, build_dir: &Path, env: &HashMap<String, String>) -> Result<()> {
        self.run(&["install".to_string()], build_dir, env)?;
        Ok(())
    }

    fn compile(&self, build_dir: &Path, env: &HashMap<String, String>) -> Result<()> {
        self.run(&["compile".to_string()], build_dir, env)?;
        Ok(())
    }

    fn test(&self, build_dir: &Path, env: &HashMap<String, String>) -> Result<()> {
        self.run(&["test".to_string()], build_dir, env)?;
        Ok(())
    }

    fn introspect_installed(&self, build_dir: &Path, prefix: &Path, env: &HashMap<String, String>) -> Result<Vec<String>> {
        let output = self.run(
            &["introspect".to_string(), "--installed".to_string()],
            build_dir,
            env,
        )?;
        let installed: HashMap<String, String> = serde_json::from_slice(&output.stdout)
            .with_context(|| "parsing introspect --installed output")?;

        let mut relative: Vec<String> = installed
            .values()
            .filter_map(|abs| {
                PathBuf::from(abs)
                    .strip_prefix(prefix)
                    .ok()
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        relative.sort();
        relative.dedup();
        Ok(relative)
    }
}

/// In-memory double for exercising the builder without a real build
/// system, tracking invocation counts for manifest-gating tests.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    #[derive(Default)]
    pub struct CountingBuildDriver {
        pub setup_calls: std::sync::atomic::AtomicUsize,
        pub install_calls: std::sync::atomic::AtomicUsize,
    }

    impl BuildDriver for CountingBuildDriver {
        fn setup(&self, _source_dir: &Path, _build_dir: &Path, _args: &[String], _env: &HashMap<String, String>) -> Result<()> {
            self.setup_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        fn install(&self, _build_dir: &Path, _env: &HashMap<String, String>) -> Result<()> {
            self.install_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        fn compile(&self, _build_dir: &Path, _env: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }
        fn test(&self, _build_dir: &Path, _env: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }
        fn introspect_installed(&self, _build_dir: &Path, _prefix: &Path, _env: &HashMap<String, String>) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }
}
