//! Cross-build orchestrator: clones sources, selects per-package build/host
//! machines, drives the external build system, enforces install manifests,
//! and stages the final bundle archive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use fs_err as fs;
use indexmap::{IndexMap, IndexSet};
use tar::Builder as TarBuilder;
use tracing::{info, warn};
use xz2::write::XzEncoder;

use crate::build_driver::BuildDriver;
use crate::env_init;
use crate::error::RelkitError;
use crate::machine_config::{self, MachineConfig};
use crate::machine_spec::MachineSpec;
use crate::params::{Bundle, Package, Parameters};
use crate::progress::Progress;
use crate::resolver;
use crate::sync::{SourceState, Synchronizer};

/// Inputs to one end-to-end bundle build.
pub struct BuildRequest {
    pub bundle: Bundle,
    pub build_machine: MachineSpec,
    pub host_machine: MachineSpec,
    pub only: Option<Vec<String>>,
    pub exclude: Vec<String>,
    pub verbose: bool,
}

pub struct Builder<'a> {
    pub root: PathBuf,
    pub synchronizer: Synchronizer,
    pub build_driver: &'a dyn BuildDriver,
    pub bootstrap_version: String,
}

impl<'a> Builder<'a> {
    pub fn new(root: PathBuf, synchronizer: Synchronizer, build_driver: &'a dyn BuildDriver, bootstrap_version: impl Into<String>) -> Self {
        Builder {
            root,
            synchronizer,
            build_driver,
            bootstrap_version: bootstrap_version.into(),
        }
    }

    fn cachedir(&self) -> PathBuf {
        std::env::var("FRIDA_DEPS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.root.join("deps"))
    }

    pub fn build(&self, params: &Parameters, request: &BuildRequest, mut on_progress: impl FnMut(Progress)) -> Result<PathBuf> {
        let build_machine = request.build_machine.maybe_adapt_to_host(&request.host_machine);
        let cachedir = self.cachedir();
        let workdir = cachedir.join("src");
        fs::create_dir_all(&workdir)?;

        let selected = select(&params.packages, request.bundle, request.only.as_deref(), &request.exclude)?;
        let order = resolver::topo_sort(&selected)?;
        let also_for_build = resolver::also_for_build(&selected, &order);

        on_progress(Progress::new(format!("ensuring toolchain for {}", build_machine.identifier())));
        let toolchain_prefix = cachedir.join("toolchain").join(build_machine.identifier());
        let state = self.synchronizer.sync(
            Bundle::Toolchain,
            &build_machine,
            &toolchain_prefix,
            &self.bootstrap_version,
            |p| on_progress(p),
        )?;

        let bundle_out = workdir.join(format!("_{}.out", request.bundle.name()));
        let bundle_tmp = workdir.join(format!("_{}.tmp", request.bundle.name()));
        if state == SourceState::Modified {
            let _ = fs::remove_dir_all(&bundle_out);
            let _ = fs::remove_dir_all(&bundle_tmp);
        }

        let environ: HashMap<String, String> = std::env::vars().collect();
        let host_prefix = bundle_out.join(request.host_machine.identifier());
        fs::create_dir_all(&host_prefix)?;

        let initializer = env_init::for_machine(&request.host_machine);
        let (build_cfg, host_cfg) = machine_config::generate_machine_configs(
            &build_machine,
            &request.host_machine,
            &environ,
            Some(&toolchain_prefix),
            None,
            None,
            &["meson".to_string()],
            "static",
            &bundle_tmp.join("machine-files"),
            initializer.as_ref(),
        )?;

        for id in &order {
            let pkg = &selected[id];
            on_progress(Progress::new(format!("building {}", pkg.name)));

            let clone_dir = workdir.join(&pkg.identifier);
            ensure_cloned(&clone_dir, pkg)?;

            let mut machines = vec![&request.host_machine];
            if also_for_build.contains(&pkg.identifier) {
                machines.push(&build_machine);
            }

            for machine in machines {
                let prefix = bundle_out.join(machine.identifier());
                let cfg = if *machine == build_machine { &build_cfg } else { &host_cfg };
                self.build_one(pkg, machine, &prefix, &bundle_tmp, cfg, &environ)?;
            }
        }

        let tempdir = cachedir.join(format!("_{}-stage", request.bundle.name()));
        if tempdir.exists() {
            fs::remove_dir_all(&tempdir)?;
        }
        stage_bundle(request.bundle, &host_prefix, &tempdir)?;
        adjust_manifests(&tempdir)?;
        rewrite_staged_paths(&tempdir, &host_prefix)?;
        fs::write(tempdir.join("VERSION.txt"), format!("{}\n", params.deps_version))?;

        let archive_path = cachedir.join(format!("{}-{}.tar.xz", request.bundle.name(), request.host_machine.identifier()));
        archive_directory(&tempdir, &archive_path)?;

        Ok(archive_path)
    }

    fn build_one(
        &self,
        pkg: &Package,
        machine: &MachineSpec,
        prefix: &Path,
        tmp_root: &Path,
        cfg: &MachineConfig,
        base_environ: &HashMap<String, String>,
    ) -> Result<()> {
        let manifest_path = prefix.join("manifest").join(format!("{}.pkg", pkg.identifier));
        if manifest_path.exists() {
            return Ok(());
        }

        let build_dir = tmp_root.join(machine.identifier()).join(&pkg.identifier);
        if build_dir.exists() {
            fs::remove_dir_all(&build_dir)?;
        }
        fs::create_dir_all(&build_dir)?;

        let env = cfg.make_merged_environment(base_environ);
        let source_dir = tmp_root
            .parent()
            .unwrap_or(tmp_root)
            .join(&pkg.identifier);

        let mut args = vec![
            format!("--native-file={}", cfg.machine_file_path.display()),
            format!("-Dprefix={}", prefix.display()),
            format!("-Dlibdir={}/lib", prefix.display()),
            format!("-Dpkg_config_path={}/{}/pkgconfig", prefix.display(), machine.libdatadir()),
            "-Ddefault_library=static".to_string(),
            "-Dbackend=ninja".to_string(),
            format!("-Dstrip={}", machine.toolchain_can_strip()),
        ];
        args.extend(machine.meson_optimization_options());
        for opt in &pkg.options {
            args.push(opt.value.clone());
        }

        self.build_driver.setup(&source_dir, &build_dir, &args, &env)?;
        self.build_driver.install(&build_dir, &env)?;
        let installed = self.build_driver.introspect_installed(&build_dir, prefix, &env)?;

        let mut sorted = installed;
        sorted.sort();
        fs::create_dir_all(manifest_path.parent().unwrap())?;
        fs::write(&manifest_path, format!("{}\n", sorted.join("\n")))?;
        Ok(())
    }
}

/// Selection: explicit ids, or toolchain-scope/SDK-unscoped,
/// transitively closed over dependencies, minus exclusions.
pub fn select(
    packages: &IndexMap<String, Package>,
    bundle: Bundle,
    only: Option<&[String]>,
    exclude: &[String],
) -> Result<IndexMap<String, Package>> {
    let seeds: Vec<String> = if let Some(ids) = only {
        ids.to_vec()
    } else {
        match bundle {
            Bundle::Toolchain => packages
                .values()
                .filter(|p| p.scope.as_deref() == Some("toolchain"))
                .map(|p| p.identifier.clone())
                .collect(),
            Bundle::Sdk => packages
                .values()
                .filter(|p| p.scope.is_none())
                .map(|p| p.identifier.clone())
                .collect(),
        }
    };

    let closed = close_over_dependencies(&seeds, packages)?;

    let exclude_set: IndexSet<&str> = exclude.iter().map(|s| s.as_str()).collect();
    Ok(closed
        .into_iter()
        .filter(|(id, _)| !exclude_set.contains(id.as_str()))
        .collect())
}

fn close_over_dependencies(seeds: &[String], packages: &IndexMap<String, Package>) -> Result<IndexMap<String, Package>> {
    let mut result = IndexMap::new();
    let mut stack: Vec<String> = seeds.to_vec();
    while let Some(id) = stack.pop() {
        if result.contains_key(&id) {
            continue;
        }
        let pkg = packages
            .get(&id)
            .ok_or_else(|| RelkitError::MissingDependencyError(id.clone()))?;
        result.insert(id.clone(), pkg.clone());
        for dep in &pkg.dependencies {
            if !result.contains_key(&dep.identifier) {
                stack.push(dep.identifier.clone());
            }
        }
    }
    Ok(result)
}

fn ensure_cloned(clone_dir: &Path, pkg: &Package) -> Result<()> {
    if clone_dir.exists() {
        let output = Command::new("git")
            .args(["rev-parse", "FETCH_HEAD"])
            .current_dir(clone_dir)
            .output()
            .with_context(|| format!("reading FETCH_HEAD in {}", clone_dir.display()))?;
        if output.status.success() {
            let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if sha != pkg.version {
                warn!(package = %pkg.identifier, expected = %pkg.version, actual = %sha, "clone SHA does not match declared version");
            }
        }
        return Ok(());
    }

    fs::create_dir_all(clone_dir)?;
    run_git(clone_dir, &["init"])?;
    run_git(clone_dir, &["remote", "add", "origin", &pkg.display_url])?;
    run_git(clone_dir, &["fetch", "--depth", "1", "origin", &pkg.version])?;
    run_git(clone_dir, &["checkout", "FETCH_HEAD"])?;
    run_git(clone_dir, &["submodule", "update", "--init", "--recursive", "--depth", "1"])?;
    Ok(())
}

fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let argv: Vec<String> = std::iter::once("git".to_string())
        .chain(args.iter().map(|s| s.to_string()))
        .collect();
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("running {}", argv.join(" ")))?;
    if !output.status.success() {
        bail!(RelkitError::from_process_output(&argv, &output));
    }
    Ok(())
}

/// Stage files from `prefix` into `tempdir` according to the bundle type
/// Symlinks are skipped.
fn stage_bundle(bundle: Bundle, prefix: &Path, tempdir: &Path) -> Result<()> {
    fs::create_dir_all(tempdir)?;
    for entry in walkdir::WalkDir::new(prefix) {
        let entry = entry?;
        if entry.file_type().is_symlink() {
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(prefix).unwrap();
        let included = match bundle {
            Bundle::Sdk => is_sdk_related(rel),
            Bundle::Toolchain => is_toolchain_related(rel),
        };
        if !included {
            continue;
        }
        let dest = tempdir.join(rel);
        fs::create_dir_all(dest.parent().unwrap())?;
        fs::copy(entry.path(), &dest)?;
    }
    Ok(())
}

fn has_component(rel: &Path, name: &str) -> bool {
    rel.components().any(|c| c.as_os_str() == name)
}

fn under_bin(rel: &Path) -> bool {
    rel.components().next().map(|c| c.as_os_str() == "bin").unwrap_or(false)
}

fn extension_of(rel: &Path) -> Option<&str> {
    rel.extension().and_then(|e| e.to_str())
}

fn stem_of(rel: &Path) -> Option<&str> {
    rel.file_stem().and_then(|e| e.to_str())
}

/// SDK-related staging predicate.
pub fn is_sdk_related(rel: &Path) -> bool {
    if matches!(extension_of(rel), Some("vapi") | Some("deps")) {
        return true;
    }
    if has_component(rel, "share") {
        return false;
    }
    if under_bin(rel) {
        return rel
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("v8-mksnapshot-"))
            .unwrap_or(false);
    }
    if extension_of(rel) == Some("pdb") {
        return false;
    }
    true
}

const TOOLCHAIN_EXCLUDED_BIN_NAMES: &[&str] = &["gdbus", "gio", "gobject-query", "gsettings"];

/// Toolchain-related staging predicate.
pub fn is_toolchain_related(rel: &Path) -> bool {
    if matches!(extension_of(rel), Some("vapi") | Some("deps")) {
        return true;
    }
    if rel.components().next().map(|c| c.as_os_str() == "manifest").unwrap_or(false) {
        return true;
    }
    if under_bin(rel) {
        if extension_of(rel) == Some("pdb") {
            return false;
        }
        let stem = stem_of(rel).unwrap_or_default();
        if TOOLCHAIN_EXCLUDED_BIN_NAMES.contains(&stem) {
            return false;
        }
        if stem.starts_with("gspawn-") {
            return false;
        }
        return true;
    }
    false
}

const WINDOWS_MIXIN_ALLOWED_BIN_STEMS: &[&str] = &["bison", "flex", "m4", "nasm", "vswhere"];

/// Windows toolchain mixin predicate: selects files copied from the
/// build-machine toolchain prefix into the host-toolchain staging tree.
pub fn is_windows_toolchain_mixin_related(rel: &Path) -> bool {
    if rel == Path::new("VERSION.txt") {
        return false;
    }
    if rel.components().next().map(|c| c.as_os_str() == "manifest").unwrap_or(false) {
        return false;
    }
    if matches!(extension_of(rel), Some("vapi") | Some("deps")) {
        return false;
    }
    let stem = stem_of(rel).unwrap_or_default();
    if stem.starts_with("vala") || stem.starts_with("vapi") || stem.starts_with("gen-introspect") {
        return false;
    }
    if under_bin(rel) {
        let name = rel.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.starts_with("vala-gen-introspect") {
            return false;
        }
        return WINDOWS_MIXIN_ALLOWED_BIN_STEMS.contains(&stem) || stem.starts_with("msys-");
    }
    false
}

/// Drop manifest entries whose recorded path no longer exists under
/// `tempdir`; delete manifests left empty.
fn adjust_manifests(tempdir: &Path) -> Result<()> {
    let manifest_dir = tempdir.join("manifest");
    if !manifest_dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(&manifest_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pkg") {
            continue;
        }
        let contents = fs::read_to_string(&path)?;
        let mut kept: Vec<&str> = contents
            .lines()
            .filter(|line| !line.is_empty() && tempdir.join(line).exists())
            .collect();
        kept.sort();
        if kept.is_empty() {
            fs::remove_file(&path)?;
        } else {
            fs::write(&path, format!("{}\n", kept.join("\n")))?;
        }
    }
    Ok(())
}

/// Replace the install prefix with the appropriate template token in every
/// staged UTF-8 file.
fn rewrite_staged_paths(tempdir: &Path, prefix: &Path) -> Result<()> {
    let native = prefix.to_string_lossy().into_owned();
    let posix = path_slash::PathExt::to_slash_lossy(prefix).into_owned();

    for entry in walkdir::WalkDir::new(tempdir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Ok(contents) = fs::read_to_string(path) else {
            continue;
        };
        let is_pc = path.extension().and_then(|e| e.to_str()) == Some("pc");
        let token = if is_pc { "${frida_sdk_prefix}" } else { "@FRIDA_TOOLROOT@" };

        let mut rewritten = contents.replace(&native, token);
        if posix != native {
            rewritten = rewritten.replace(&posix, token);
        }
        if rewritten == contents {
            continue;
        }
        fs::write(path, &rewritten)?;
        if !is_pc {
            let new_path = path.with_file_name(format!(
                "{}.frida.in",
                path.file_name().unwrap().to_string_lossy()
            ));
            fs::rename(path, new_path)?;
        }
    }
    Ok(())
}

fn archive_directory(tempdir: &Path, archive_path: &Path) -> Result<PathBuf> {
    let file = fs::File::create(archive_path)
        .with_context(|| format!("creating archive {}", archive_path.display()))?;
    let encoder = XzEncoder::new(file, 6);
    let mut builder = TarBuilder::new(encoder);
    builder.append_dir_all("", tempdir)
        .with_context(|| format!("archiving {}", tempdir.display()))?;
    builder.into_inner()?.finish()?;
    Ok(archive_path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Dependency, ForMachine, Option_};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn pkg(id: &str, scope: Option<&str>, deps: &[&str]) -> Package {
        Package {
            identifier: id.to_string(),
            name: id.to_string(),
            display_url: format!("https://example.org/{id}.git"),
            version: "deadbeef".to_string(),
            options: vec![Option_ { value: "-Dfoo=bar".to_string() }],
            dependencies: deps
                .iter()
                .map(|d| Dependency { identifier: d.to_string(), for_machine: ForMachine::Host })
                .collect(),
            scope: scope.map(str::to_string),
        }
    }

    #[test]
    fn selection_for_sdk_picks_unscoped_transitively() {
        let mut packages = IndexMap::new();
        packages.insert("a".to_string(), pkg("a", None, &["b"]));
        packages.insert("b".to_string(), pkg("b", Some("toolchain"), &[]));
        packages.insert("c".to_string(), pkg("c", None, &["d"]));
        packages.insert("d".to_string(), pkg("d", None, &[]));

        let selected = select(&packages, Bundle::Sdk, None, &[]).unwrap();
        let mut ids: Vec<&str> = selected.keys().map(String::as_str).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn selection_for_toolchain_closes_transitively() {
        let mut packages = IndexMap::new();
        packages.insert("a".to_string(), pkg("a", None, &["b"]));
        packages.insert("b".to_string(), pkg("b", Some("toolchain"), &[]));
        packages.insert("c".to_string(), pkg("c", None, &["d"]));
        packages.insert("d".to_string(), pkg("d", None, &[]));

        let selected = select(&packages, Bundle::Toolchain, None, &[]).unwrap();
        let mut ids: Vec<&str> = selected.keys().map(String::as_str).collect();
        ids.sort();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn explicit_only_set_is_closed_over_dependencies() {
        let mut packages = IndexMap::new();
        packages.insert("a".to_string(), pkg("a", None, &["b"]));
        packages.insert("b".to_string(), pkg("b", None, &[]));
        packages.insert("c".to_string(), pkg("c", None, &[]));

        let selected = select(&packages, Bundle::Sdk, Some(&["a".to_string()]), &[]).unwrap();
        let mut ids: Vec<&str> = selected.keys().map(String::as_str).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn exclusions_are_removed_after_closure() {
        let mut packages = IndexMap::new();
        packages.insert("a".to_string(), pkg("a", None, &[]));
        packages.insert("b".to_string(), pkg("b", None, &[]));

        let selected = select(&packages, Bundle::Sdk, None, &["a".to_string()]).unwrap();
        assert!(!selected.contains_key("a"));
        assert!(selected.contains_key("b"));
    }

    #[rstest]
    #[case("lib/libfrida-core.a", true)]
    #[case("include/frida-core.h", true)]
    #[case("frida-core.vapi", true)]
    #[case("share/man/man1/foo.1", false)]
    #[case("share/vala/vapi/glib-2.0.vapi", true)]
    #[case("lib/frida-core.pdb", false)]
    #[case("bin/v8-mksnapshot-x64.bin", true)]
    #[case("bin/frida-tools.exe", false)]
    fn sdk_staging_rules(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_sdk_related(Path::new(path)), expected);
    }

    #[rstest]
    #[case("bin/ninja", true)]
    #[case("bin/ninja.pdb", false)]
    #[case("bin/gdbus.exe", false)]
    #[case("bin/gspawn-win64-helper.exe", false)]
    #[case("manifest/glib.pkg", true)]
    #[case("frida-core.vapi", true)]
    #[case("lib/libglib.a", false)]
    fn toolchain_staging_rules(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_toolchain_related(Path::new(path)), expected);
    }

    #[rstest]
    #[case("VERSION.txt", false)]
    #[case("manifest/glib.pkg", false)]
    #[case("bin/bison.exe", true)]
    #[case("bin/msys-2.0.dll", true)]
    #[case("bin/ninja.exe", false)]
    #[case("frida.vapi", false)]
    fn windows_mixin_rules(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_windows_toolchain_mixin_related(Path::new(path)), expected);
    }

    #[test]
    fn staging_predicates_are_total_over_a_synthesized_tree() {
        let paths = [
            "bin/a", "bin/a.pdb", "lib/a.a", "share/x/y", "a.vapi", "a.deps", "manifest/a.pkg",
        ];
        for p in paths {
            // Must not panic and must be deterministic.
            let a = is_sdk_related(Path::new(p));
            let b = is_sdk_related(Path::new(p));
            assert_eq!(a, b);
            let a = is_toolchain_related(Path::new(p));
            let b = is_toolchain_related(Path::new(p));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn adjust_manifests_drops_missing_entries_and_removes_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_dir = dir.path().join("manifest");
        fs::create_dir_all(&manifest_dir).unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/present.a"), b"x").unwrap();

        fs::write(
            manifest_dir.join("pkg1.pkg"),
            "lib/present.a\nlib/missing.a\n",
        )
        .unwrap();
        fs::write(manifest_dir.join("pkg2.pkg"), "lib/missing-only.a\n").unwrap();

        adjust_manifests(dir.path()).unwrap();

        let pkg1 = fs::read_to_string(manifest_dir.join("pkg1.pkg")).unwrap();
        assert_eq!(pkg1, "lib/present.a\n");
        assert!(!manifest_dir.join("pkg2.pkg").exists());
    }

    #[test]
    fn pc_rewrite_is_reversible() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("out/linux-x86_64");
        fs::create_dir_all(&prefix).unwrap();

        let original = format!("prefix={}\nlibdir={}/lib\n", prefix.display(), prefix.display());
        let tempstage = dir.path().join("stage");
        fs::create_dir_all(tempstage.join("lib/pkgconfig")).unwrap();
        fs::write(tempstage.join("lib/pkgconfig/frida-core.pc"), &original).unwrap();

        rewrite_staged_paths(&tempstage, &prefix).unwrap();

        let rewritten = fs::read_to_string(tempstage.join("lib/pkgconfig/frida-core.pc")).unwrap();
        let restored = rewritten.replace("${frida_sdk_prefix}", &prefix.to_string_lossy());
        assert_eq!(restored, original);
    }

    #[test]
    fn toolchain_token_rewrite_renames_with_frida_in_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("out/linux-x86_64");
        fs::create_dir_all(&prefix).unwrap();
        let tempstage = dir.path().join("stage");
        fs::create_dir_all(tempstage.join("share/vala")).unwrap();
        fs::write(
            tempstage.join("share/vala/config.vapi"),
            format!("root={}\n", prefix.display()),
        )
        .unwrap();

        rewrite_staged_paths(&tempstage, &prefix).unwrap();

        assert!(!tempstage.join("share/vala/config.vapi").exists());
        assert!(tempstage.join("share/vala/config.vapi.frida.in").exists());
    }
}
