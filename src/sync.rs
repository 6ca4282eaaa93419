//! Bundle synchronizer: resolve a bundle's archive URL, download-or-reuse
//! it, extract atomically, and rewrite `.frida.in` template files.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use fs_err as fs;
use tar::Archive;
use tempfile::NamedTempFile;
use xz2::read::XzDecoder;

use crate::error::RelkitError;
use crate::machine_spec::MachineSpec;
use crate::params::Bundle;
use crate::progress::{Progress, ProgressSink};

/// A `.tar.xz` bundle root URL, e.g. `https://build.example.org/deps`.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    pub root_url: String,
}

/// Whether `sync` found the tree already at the requested version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Pristine,
    Modified,
}

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
const TEMPLATE_SUFFIX: &str = ".frida.in";
const TEMPLATE_TOKEN: &str = "@FRIDA_TOOLROOT@";

impl Synchronizer {
    pub fn new(root_url: impl Into<String>) -> Self {
        Synchronizer {
            root_url: root_url.into(),
        }
    }

    /// `(url, filename)` for `(bundle, machine, version)`.
    pub fn bundle_parameters(&self, bundle: Bundle, machine: &MachineSpec, version: &str) -> (String, String) {
        let os_arch_config = if bundle == Bundle::Toolchain
            && machine.os == "windows"
            && matches!(machine.arch.as_str(), "x86" | "x86_64")
        {
            "windows-x86".to_string()
        } else {
            machine.identifier()
        };
        let filename = format!("{}-{}.tar.xz", bundle.name(), os_arch_config);
        let url = format!("{}/{}/{}", self.root_url, version, filename);
        (url, filename)
    }

    /// Materialize `bundle` at `version` into `location`.
    pub fn sync(
        &self,
        bundle: Bundle,
        machine: &MachineSpec,
        location: &Path,
        version: &str,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<SourceState> {
        if let Some(existing) = read_version_file(location) {
            if existing.trim() == version {
                return Ok(SourceState::Pristine);
            }
        }

        let mut state = SourceState::Pristine;
        if location.exists() {
            fs::remove_dir_all(location)
                .with_context(|| format!("removing outdated tree at {}", location.display()))?;
            state = SourceState::Modified;
        }

        let (url, filename) = self.bundle_parameters(bundle, machine, version);

        let parent = location
            .parent()
            .ok_or_else(|| RelkitError::ConfigError(format!("location {} has no parent", location.display())))?;
        let local_archive = parent.join(&filename);

        let archive_path = if local_archive.exists() {
            on_progress(Progress::new(format!("using locally staged archive {}", local_archive.display())));
            local_archive
        } else {
            on_progress(Progress::new(format!("downloading {url}")));
            download(&url, parent)?
        };

        let staging_dir = parent.join(format!("_{}", location.file_name().unwrap().to_string_lossy()));
        if staging_dir.exists() {
            fs::remove_dir_all(&staging_dir)
                .with_context(|| format!("clearing stale staging dir {}", staging_dir.display()))?;
        }
        fs::create_dir_all(&staging_dir)?;

        let extraction = extract_archive(&archive_path, &staging_dir);
        if extraction.is_err() {
            let _ = fs::remove_dir_all(&staging_dir);
        }
        extraction?;

        on_progress(Progress::new("rewriting template files"));
        rewrite_templates(&staging_dir, location)?;

        fs::rename(&staging_dir, location)
            .with_context(|| format!("renaming {} to {}", staging_dir.display(), location.display()))?;

        if !local_archive.exists() || archive_path != local_archive {
            let _ = fs::remove_file(&archive_path);
        }

        Ok(state)
    }

    /// Poll the bundle's URL with HEAD requests every 5 minutes until a
    /// non-404 response is observed.
    pub fn wait(&self, bundle: Bundle, machine: &MachineSpec, version: &str) -> Result<()> {
        let (url, _) = self.bundle_parameters(bundle, machine, version);
        loop {
            match ureq::head(&url).call() {
                Ok(_) => return Ok(()),
                Err(ureq::Error::StatusCode(404)) => {
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Err(ureq::Error::StatusCode(_)) => return Ok(()),
                Err(other) => {
                    bail!(RelkitError::NetworkError {
                        url: url.clone(),
                        source: Box::new(other),
                    });
                }
            }
        }
    }
}

fn read_version_file(location: &Path) -> Option<String> {
    if !location.exists() {
        return None;
    }
    fs::read_to_string(location.join("VERSION.txt")).ok()
}

fn download(url: &str, parent: &Path) -> Result<PathBuf> {
    fs::create_dir_all(parent)?;
    let response = ureq::get(url).call();
    let mut response = match response {
        Ok(r) => r,
        Err(ureq::Error::StatusCode(404)) => bail!(RelkitError::BundleNotFound { url: url.to_string() }),
        Err(other) => bail!(RelkitError::NetworkError {
            url: url.to_string(),
            source: Box::new(other),
        }),
    };

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file under {}", parent.display()))?;
    let mut reader = response.body_mut().as_reader();
    std::io::copy(&mut reader, &mut tmp).with_context(|| format!("downloading {url}"))?;
    let (_, path) = tmp.keep().context("persisting downloaded archive")?;
    Ok(path)
}

fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    let decoder = XzDecoder::new(file);
    let mut archive = Archive::new(decoder);
    archive
        .unpack(dest)
        .with_context(|| format!("extracting {} into {}", archive_path.display(), dest.display()))?;
    Ok(())
}

/// Rewrite every `*.frida.in` file under `staging_dir`, replacing
/// `@FRIDA_TOOLROOT@` with the POSIX form of `final_location`, then drop the
/// `.frida.in` suffix.
fn rewrite_templates(staging_dir: &Path, final_location: &Path) -> Result<()> {
    let replacement = path_slash::PathExt::to_slash_lossy(final_location);
    for entry in walkdir::WalkDir::new(staging_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(TEMPLATE_SUFFIX) {
            continue;
        }
        let Ok(contents) = fs::read_to_string(path) else {
            continue; // not UTF-8, leave it as-is
        };
        let rewritten = contents.replace(TEMPLATE_TOKEN, &replacement);
        fs::write(path, rewritten)?;

        let new_name = &name[..name.len() - TEMPLATE_SUFFIX.len()];
        let new_path = path.with_file_name(new_name);
        fs::rename(path, new_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn windows_toolchain_collapses_to_windows_x86() {
        let sync = Synchronizer::new("https://build.example.org/deps");
        let machine = MachineSpec::new("windows", "x86_64", Some("release".to_string()));
        let (url, filename) = sync.bundle_parameters(Bundle::Toolchain, &machine, "9");
        assert_eq!(filename, "toolchain-windows-x86.tar.xz");
        assert_eq!(url, "https://build.example.org/deps/9/toolchain-windows-x86.tar.xz");

        let machine_x86 = MachineSpec::new("windows", "x86", None);
        let (_, filename_x86) = sync.bundle_parameters(Bundle::Toolchain, &machine_x86, "9");
        assert_eq!(filename_x86, filename);
    }

    #[test]
    fn sdk_bundle_uses_plain_identifier() {
        let sync = Synchronizer::new("https://build.example.org/deps");
        let machine = MachineSpec::new("linux", "x86_64", None);
        let (url, filename) = sync.bundle_parameters(Bundle::Sdk, &machine, "1.2.3");
        assert_eq!(filename, "sdk-linux-x86_64.tar.xz");
        assert_eq!(url, "https://build.example.org/deps/1.2.3/sdk-linux-x86_64.tar.xz");
    }

    #[test]
    fn version_gate_short_circuits_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("sdk");
        fs::create_dir_all(&location).unwrap();
        fs::write(location.join("VERSION.txt"), "1.2.3").unwrap();

        let sync = Synchronizer::new("https://build.invalid.example");
        let machine = MachineSpec::new("linux", "x86_64", None);
        let state = sync
            .sync(Bundle::Sdk, &machine, &location, "1.2.3", |_| {})
            .unwrap();
        assert_eq!(state, SourceState::Pristine);
    }

    #[test]
    fn rewrite_templates_strips_suffix_and_substitutes_token() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("_sdk");
        fs::create_dir_all(&staging).unwrap();
        fs::write(
            staging.join("frida-core.pc.frida.in"),
            "prefix=@FRIDA_TOOLROOT@\n",
        )
        .unwrap();

        let final_location = dir.path().join("sdk");
        rewrite_templates(&staging, &final_location).unwrap();

        assert!(!staging.join("frida-core.pc.frida.in").exists());
        let rewritten = fs::read_to_string(staging.join("frida-core.pc")).unwrap();
        assert!(!rewritten.contains("@FRIDA_TOOLROOT@"));
        assert!(rewritten.contains("prefix="));
    }
}
