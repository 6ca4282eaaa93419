//! Machine-configuration file generator: writes the hierarchical
//! machine-description files consumed by the external build driver and
//! merges/strips environments for cross builds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use indexmap::IndexMap;
use which::which;

use crate::env_init::EnvironmentInitializer;
use crate::error::RelkitError;
use crate::machine_spec::MachineSpec;

/// Host-side toolchain environment variables stripped from the
/// build-machine environment of a cross build.
const HOST_TOOLCHAIN_ENV_VARS: &[&str] = &[
    "CC", "CXX", "OBJC", "OBJCXX", "AR", "AS", "LD", "NM", "OBJCOPY", "OBJDUMP", "RANLIB",
    "READELF", "STRIP", "WINDRES", "CMAKE", "QMAKE", "PKG_CONFIG", "MAKE", "VAPIGEN", "LLVM_CONFIG",
    "CFLAGS", "CXXFLAGS", "OBJCFLAGS", "LDFLAGS",
];

/// Meson built-in options that are list-typed and must be rendered as a
/// TOML array even though only one value is ever set here.
const LIST_TYPED_BUILT_IN_OPTIONS: &[&str] = &["pkg_config_path", "vala_args"];

/// Tools probed under `<toolchain_prefix>/bin` when generating a machine config.
const TOOLCHAIN_TOOL_NAMES: &[&str] = &[
    "ninja",
    "gdbus-codegen",
    "gio-querymodules",
    "glib-compile-resources",
    "glib-compile-schemas",
    "glib-genmarshal",
    "glib-mkenums",
    "flex",
    "bison",
    "nasm",
];

/// Output of [`generate_machine_configs`] for one machine: the path to the
/// written machine-description file plus the `binpath`/`environ` overlay
/// every build-driver invocation for that machine must apply.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub machine_file_path: PathBuf,
    pub binpath: Vec<PathBuf>,
    pub environ: IndexMap<String, String>,
}

impl MachineConfig {
    /// Prepend `binpath` to `PATH` and merge `environ` on top of `base`.
    pub fn make_merged_environment(&self, base: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = base.clone();

        let existing_path = merged.get("PATH").cloned().unwrap_or_default();
        let mut path_parts: Vec<String> = self
            .binpath
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if !existing_path.is_empty() {
            path_parts.push(existing_path);
        }
        merged.insert("PATH".to_string(), std::env::join_paths(&path_parts).map_or_else(
            |_| path_parts.join(":"),
            |joined| joined.to_string_lossy().into_owned(),
        ));

        for (k, v) in &self.environ {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Strip host-toolchain variables and rename `*_FOR_BUILD` ones for the
/// build-machine side of a cross build.
pub fn strip_build_environ(environ: &HashMap<String, String>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (k, v) in environ {
        if HOST_TOOLCHAIN_ENV_VARS.contains(&k.as_str()) {
            continue;
        }
        if let Some(base) = k.strip_suffix("_FOR_BUILD") {
            out.insert(base.to_string(), v.clone());
        } else {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

/// Builds the build-machine and host-machine configs for one build.
#[allow(clippy::too_many_arguments)]
pub fn generate_machine_configs(
    build_machine: &MachineSpec,
    host_machine: &MachineSpec,
    environ: &HashMap<String, String>,
    toolchain_prefix: Option<&Path>,
    build_sdk_prefix: Option<&Path>,
    host_sdk_prefix: Option<&Path>,
    call_meson: &[String],
    default_library: &str,
    outdir: &Path,
    initializer: &dyn EnvironmentInitializer,
) -> Result<(MachineConfig, MachineConfig)> {
    let is_cross = build_machine != host_machine;

    let build_environ = if is_cross {
        strip_build_environ(environ)
    } else {
        environ.clone()
    };

    fs::create_dir_all(outdir)?;

    let build_cfg = generate_one(
        build_machine,
        &build_environ,
        build_sdk_prefix,
        build_machine,
        false,
        toolchain_prefix,
        call_meson,
        default_library,
        outdir,
        "build",
        initializer,
    )?;

    let host_cfg = generate_one(
        host_machine,
        environ,
        host_sdk_prefix,
        build_machine,
        is_cross,
        toolchain_prefix,
        call_meson,
        default_library,
        outdir,
        "host",
        initializer,
    )?;

    Ok((build_cfg, host_cfg))
}

#[allow(clippy::too_many_arguments)]
fn generate_one(
    machine: &MachineSpec,
    base_environ: &HashMap<String, String>,
    sdk_prefix: Option<&Path>,
    build_machine: &MachineSpec,
    is_cross: bool,
    toolchain_prefix: Option<&Path>,
    call_meson: &[String],
    default_library: &str,
    outdir: &Path,
    role: &str,
    initializer: &dyn EnvironmentInitializer,
) -> Result<MachineConfig> {
    let mut binpath = Vec::new();
    let mut environ: IndexMap<String, String> = base_environ
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut constants: IndexMap<String, String> = IndexMap::new();
    let mut binaries: IndexMap<String, Vec<String>> = IndexMap::new();
    let mut built_in_options: IndexMap<String, String> = IndexMap::new();
    let mut properties: IndexMap<String, String> = IndexMap::new();

    initializer.initialize(
        machine,
        sdk_prefix,
        build_machine,
        is_cross,
        &mut environ,
        call_meson,
        &mut Config {
            binaries: &mut binaries,
            built_in_options: &mut built_in_options,
            properties: &mut properties,
            constants: &mut constants,
        },
    )?;

    if let Some(prefix) = toolchain_prefix {
        let bin_dir = prefix.join("bin");
        for tool in TOOLCHAIN_TOOL_NAMES {
            let candidate = bin_dir.join(format!("{}{}", tool, machine.executable_suffix()));
            if candidate.exists() {
                binaries.insert((*tool).to_string(), vec![candidate.to_string_lossy().into_owned()]);
                if *tool == "bison" {
                    constants.insert(
                        "bison_pkgdatadir".to_string(),
                        prefix.join("share/bison").to_string_lossy().into_owned(),
                    );
                    environ.insert(
                        "BISON_PKGDATADIR".to_string(),
                        prefix.join("share/bison").to_string_lossy().into_owned(),
                    );
                    environ.insert("M4".to_string(), which("m4").map(|p| p.to_string_lossy().into_owned()).unwrap_or_else(|_| "m4".to_string()));
                }
            }
        }

        let pkg_config = bin_dir.join(format!("pkg-config{}", machine.executable_suffix()));
        if pkg_config.exists() {
            let mut args = vec![pkg_config.to_string_lossy().into_owned()];
            if default_library == "static" {
                args.push("--static".to_string());
            }
            if let Some(sdk) = sdk_prefix {
                args.push(format!(
                    "--define-variable=frida_sdk_prefix={}",
                    sdk.display()
                ));
            }
            binaries.insert("pkg-config".to_string(), args);
        }
        if let Some(sdk) = sdk_prefix {
            built_in_options.insert(
                "pkg_config_path".to_string(),
                sdk.join(machine.libdatadir()).join("pkgconfig").to_string_lossy().into_owned(),
            );
        }

        if let Some((valac, vapi_dir, api_version)) = detect_vala(prefix, machine) {
            let mut args = vec![valac.to_string_lossy().into_owned()];
            args.push(format!("--vapidir={}", vapi_dir.display()));
            binaries.insert("vala".to_string(), args);
            if let Some(sdk) = sdk_prefix {
                built_in_options.insert(
                    "vala_args".to_string(),
                    format!("--vapidir={}", sdk.join(format!("share/vala-{api_version}/vapi")).display()),
                );
            }
        }

        binpath.push(bin_dir);
    }

    properties.insert(
        "needs_exe_wrapper".to_string(),
        exe_wrapper_required(machine, build_machine, &environ, &mut binaries)?.to_string(),
    );

    let machine_file_path = outdir.join(format!("{role}-{}.txt", machine.identifier()));
    write_machine_file(
        &machine_file_path,
        machine,
        &constants,
        &binaries,
        &built_in_options,
        &properties,
    )?;

    Ok(MachineConfig {
        machine_file_path,
        binpath,
        environ,
    })
}

fn exe_wrapper_required(
    machine: &MachineSpec,
    build_machine: &MachineSpec,
    environ: &IndexMap<String, String>,
    binaries: &mut IndexMap<String, Vec<String>>,
) -> Result<bool> {
    if environ.get("FRIDA_CAN_RUN_HOST_BINARIES").map(String::as_str) == Some("yes") || machine == build_machine {
        return Ok(false);
    }

    if let Some(sysroot) = environ.get("FRIDA_QEMU_SYSROOT") {
        let qemu_arch = match machine.arch.as_str() {
            "armeabi" | "armhf" => "arm",
            "armbe8" => "armeb",
            "arm64" => "aarch64",
            other => other,
        };
        let qemu_name = format!("qemu-{qemu_arch}");
        let qemu_path = which(&qemu_name)
            .map_err(|_| RelkitError::QEMUNotFoundError { arch: qemu_arch.to_string() })?;
        binaries.insert(
            "exe_wrapper".to_string(),
            vec![qemu_path.to_string_lossy().into_owned(), "-L".to_string(), sysroot.clone()],
        );
    }

    Ok(true)
}

fn detect_vala(toolchain_prefix: &Path, machine: &MachineSpec) -> Option<(PathBuf, PathBuf, String)> {
    let share_dir = toolchain_prefix.join("share");
    let entries = fs::read_dir(&share_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(api_version) = name.strip_prefix("vala-") {
            let vapi_dir = share_dir.join(&*name).join("vapi");
            let valac = toolchain_prefix
                .join("bin")
                .join(format!("valac-{}{}", api_version, machine.executable_suffix()));
            if valac.exists() {
                return Some((valac, vapi_dir, api_version.to_string()));
            }
        }
    }
    None
}

/// A writable view of the non-`host_machine` sections, passed to an
/// [`EnvironmentInitializer`].
pub struct Config<'a> {
    pub constants: &'a mut IndexMap<String, String>,
    pub binaries: &'a mut IndexMap<String, Vec<String>>,
    pub built_in_options: &'a mut IndexMap<String, String>,
    pub properties: &'a mut IndexMap<String, String>,
}

fn write_machine_file(
    path: &Path,
    machine: &MachineSpec,
    constants: &IndexMap<String, String>,
    binaries: &IndexMap<String, Vec<String>>,
    built_in_options: &IndexMap<String, String>,
    properties: &IndexMap<String, String>,
) -> Result<()> {
    let mut out = String::new();

    out.push_str("[constants]\n");
    for (k, v) in constants {
        out.push_str(&format!("{k} = '{v}'\n"));
    }
    out.push('\n');

    out.push_str("[binaries]\n");
    for (k, args) in binaries {
        let rendered: Vec<String> = args.iter().map(|a| format!("'{a}'")).collect();
        out.push_str(&format!("{k} = [{}]\n", rendered.join(", ")));
    }
    out.push('\n');

    out.push_str("[built-in options]\n");
    for (k, v) in built_in_options {
        if LIST_TYPED_BUILT_IN_OPTIONS.contains(&k.as_str()) {
            out.push_str(&format!("{k} = ['{v}']\n"));
        } else {
            out.push_str(&format!("{k} = '{v}'\n"));
        }
    }
    out.push('\n');

    out.push_str("[properties]\n");
    for (k, v) in properties {
        out.push_str(&format!("{k} = {v}\n"));
    }
    out.push('\n');

    out.push_str("[host_machine]\n");
    out.push_str(&format!("system = '{}'\n", machine.system()));
    out.push_str(&format!("subsystem = '{}'\n", machine.subsystem()));
    out.push_str(&format!("kernel = '{}'\n", machine.kernel()));
    out.push_str(&format!("cpu_family = '{}'\n", machine.cpu_family()));
    out.push_str(&format!("cpu = '{}'\n", machine.cpu()));
    out.push_str(&format!("endian = '{}'\n", machine.endian()));

    fs::write(path, out).with_context(|| format!("writing machine file {}", path.display()))?;
    Ok(())
}
