//! Canonical machine descriptor: `{os, arch, config?, triplet?}` plus the
//! pure derived properties the build-driver machine files and the
//! synchronizer's URL scheme are computed from.
//!
//! Grounded in the same spirit as a `target-lexicon::Triple`, but the
//! vocabulary (os/arch/config names, the GNU-triplet normalization rules)
//! is this ecosystem's own, so the derivations are hand-rolled rather than
//! delegated to the `target-lexicon` types directly.

use std::fmt;
use std::process::Command;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::RelkitError;

/// Operating systems recognized by the known-name fast path in [`MachineSpec::parse`].
const KNOWN_OS_NAMES: &[&str] = &[
    "linux", "windows", "macos", "ios", "watchos", "tvos", "android", "freebsd", "qnx",
];

/// Per-os override of the general `cpu_type` table, checked first.
fn cpu_type_override(os: &str, arch: &str) -> Option<&'static str> {
    match (os, arch) {
        ("linux", "arm") => Some("armv5t"),
        ("linux", "armbe8") => Some("armv6t"),
        ("linux", "armhf") => Some("armv7a"),
        ("linux", "mips") => Some("mips1"),
        ("linux", "mipsel") => Some("mips1"),
        ("linux", "mips64") => Some("mips64r2"),
        ("linux", "mips64el") => Some("mips64r2"),
        ("android", "x86") => Some("i686"),
        ("qnx", "arm") => Some("armv6"),
        ("qnx", "armeabi") => Some("armv7"),
        _ => None,
    }
}

/// General `arch -> cpu` table, checked when no per-os override applies.
fn cpu_type(arch: &str) -> Option<&'static str> {
    match arch {
        "arm" => Some("armv7"),
        "armbe8" => Some("armv6"),
        "armhf" => Some("armv7hf"),
        "armeabi" => Some("armv7eabi"),
        "arm64" | "arm64e" | "arm64eoabi" => Some("aarch64"),
        _ => None,
    }
}

/// A canonical `{os, arch, config?, triplet?}` descriptor.
///
/// Equality and hashing are on [`MachineSpec::identifier`]; `triplet` is
/// carried for informational purposes (it's emitted verbatim into machine
/// config files when present) but does not participate in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    pub os: String,
    pub arch: String,
    pub config: Option<String>,
    pub triplet: Option<String>,
}

impl PartialEq for MachineSpec {
    fn eq(&self, other: &Self) -> bool {
        self.identifier() == other.identifier()
    }
}
impl Eq for MachineSpec {}

impl fmt::Display for MachineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

impl MachineSpec {
    pub fn new(os: impl Into<String>, arch: impl Into<String>, config: Option<String>) -> Self {
        MachineSpec {
            os: os.into(),
            arch: arch.into(),
            config,
            triplet: None,
        }
    }

    /// Parse either `os-arch[-config]` shorthand or a GNU-style
    /// `arch-vendor-kernel-system` triplet (3 or 4 dash-separated parts).
    pub fn parse(raw: &str) -> Result<MachineSpec> {
        let parts: Vec<&str> = raw.split('-').collect();
        if parts.is_empty() || parts[0].is_empty() {
            return Err(RelkitError::ConfigError(format!("empty machine spec {raw:?}")).into());
        }

        if KNOWN_OS_NAMES.contains(&parts[0]) && (parts.len() == 2 || parts.len() == 3) {
            let os = parts[0].to_string();
            let arch = parts[1].to_string();
            let config = parts.get(2).map(|s| s.to_string());
            return Ok(MachineSpec {
                os,
                arch,
                config,
                triplet: None,
            });
        }

        if parts.len() == 3 || parts.len() == 4 {
            return Self::parse_gnu_triplet(raw, &parts);
        }

        Err(RelkitError::ConfigError(format!("unrecognized machine spec {raw:?}")).into())
    }

    fn parse_gnu_triplet(raw: &str, parts: &[&str]) -> Result<MachineSpec> {
        let (arch_raw, kernel_raw, system_raw) = if parts.len() == 4 {
            (parts[0], parts[2], parts[3])
        } else {
            (parts[0], parts[1], parts[2])
        };

        let mut arch = match arch_raw {
            "i386" | "i486" | "i586" | "i686" => "x86".to_string(),
            "aarch64" => "arm64".to_string(),
            "aarch64_be" => "arm64be".to_string(),
            "armeb" => "armbe8".to_string(),
            other => other.to_string(),
        };

        let mut system = system_raw.to_string();
        if let Some(stripped) = system.strip_suffix("_ilp32") {
            system = stripped.to_string();
            arch.push_str("ilp32");
        }

        let (os, config) = if kernel_raw == "w64" || kernel_raw.starts_with("w64") {
            ("windows".to_string(), Some("mingw".to_string()))
        } else if kernel_raw.contains("darwin") || kernel_raw.contains("apple") {
            ("macos".to_string(), None)
        } else if kernel_raw.contains("freebsd") {
            ("freebsd".to_string(), None)
        } else if kernel_raw.contains("nto") {
            ("qnx".to_string(), None)
        } else {
            ("linux".to_string(), None)
        };

        if arch_raw == "arm" {
            if system.ends_with("eabihf") {
                arch = "armhf".to_string();
            } else if os == "qnx" && system.ends_with("eabi") {
                arch = "armeabi".to_string();
            }
        }

        let config = config.or_else(|| {
            if system.starts_with("musl") {
                Some("musl".to_string())
            } else {
                None
            }
        });

        Ok(MachineSpec {
            os,
            arch,
            config,
            triplet: Some(raw.to_string()),
        })
    }

    /// Sniff the local machine: os/arch from `std::env::consts`, refined by
    /// a musl check on Linux and a native-arch probe on Windows.
    pub fn detect_local() -> Result<MachineSpec> {
        let os = match std::env::consts::OS {
            "macos" => "macos",
            other => other,
        }
        .to_string();

        let mut arch = match std::env::consts::ARCH {
            "x86_64" => "x86_64",
            "x86" => "x86",
            "aarch64" => "arm64",
            "arm" => "armhf",
            other => other,
        }
        .to_string();

        let mut config = None;

        if os == "linux" {
            if let Ok(output) = Command::new("ldd").arg("--version").output() {
                let text = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                if text.to_lowercase().contains("musl") {
                    config = Some("musl".to_string());
                }
            }
        }

        if os == "windows" {
            if let Some(native) = detect_windows_native_arch() {
                arch = native;
            }
        }

        Ok(MachineSpec {
            os,
            arch,
            config,
            triplet: None,
        })
    }

    pub fn identifier(&self) -> String {
        match &self.config {
            Some(config) => format!("{}-{}-{}", self.os, self.arch, config),
            None => format!("{}-{}", self.os, self.arch),
        }
    }

    pub fn os_dash_arch(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    pub fn os_dash_config(&self) -> String {
        match &self.config {
            Some(config) => format!("{}-{}", self.os, config),
            None => self.os.clone(),
        }
    }

    pub fn executable_suffix(&self) -> &'static str {
        if self.os == "windows" { ".exe" } else { "" }
    }

    pub fn is_apple(&self) -> bool {
        matches!(self.os.as_str(), "macos" | "ios" | "watchos" | "tvos")
    }

    pub fn system(&self) -> String {
        if self.is_apple() {
            "darwin".to_string()
        } else {
            self.os.clone()
        }
    }

    pub fn subsystem(&self) -> String {
        if self.is_apple() {
            self.os_dash_config()
        } else {
            self.os.clone()
        }
    }

    pub fn kernel(&self) -> &str {
        match self.os.as_str() {
            "windows" => "nt",
            "macos" | "ios" | "watchos" | "tvos" => "xnu",
            "qnx" => "nto",
            other => other,
        }
    }

    pub fn cpu_family(&self) -> String {
        match self.arch.as_str() {
            "armbe8" | "armeabi" | "armhf" => "arm".to_string(),
            "arm64" | "arm64e" | "arm64eoabi" => "aarch64".to_string(),
            "mipsel" => "mips".to_string(),
            "mips64el" => "mips64".to_string(),
            // Everything else (x86, x86_64, arm, arm64be, arm64ilp32, mips,
            // mips64, s390x, ...) passes through unchanged.
            other => other.to_string(),
        }
    }

    pub fn cpu(&self) -> String {
        if let Some(cpu) = cpu_type_override(&self.os, &self.arch) {
            return cpu.to_string();
        }
        if let Some(cpu) = cpu_type(&self.arch) {
            return cpu.to_string();
        }
        self.arch.clone()
    }

    pub fn endian(&self) -> &'static str {
        match self.arch.as_str() {
            "s390x" | "mips" | "mips64" | "arm64be" | "armbe8" => "big",
            _ => "little",
        }
    }

    pub fn pointer_size(&self) -> u8 {
        if self.arch == "x86_64"
            || self.arch == "s390x"
            || self.arch.starts_with("arm64")
            || self.arch.starts_with("mips64")
        {
            8
        } else {
            4
        }
    }

    pub fn libdatadir(&self) -> &'static str {
        if self.os == "freebsd" { "libdata" } else { "lib" }
    }

    pub fn toolchain_is_msvc(&self) -> bool {
        self.os == "windows" && self.config.as_deref() != Some("mingw")
    }

    pub fn toolchain_can_strip(&self) -> bool {
        !self.toolchain_is_msvc()
    }

    pub fn msvc_platform(&self) -> &'static str {
        if self.arch == "x86_64" { "x64" } else { "x86" }
    }

    /// If this spec targets MSVC and has no explicit `config`, default it to
    /// `recommended` (or `"mt"`).
    pub fn default_missing(&self, recommended_vscrt: Option<&str>) -> MachineSpec {
        let mut out = self.clone();
        if out.toolchain_is_msvc() && out.config.is_none() {
            out.config = Some(recommended_vscrt.unwrap_or("mt").to_string());
        }
        out
    }

    /// Adopt `host`'s identity when it represents a more specific
    /// description of what this one already names.
    pub fn maybe_adapt_to_host(&self, host: &MachineSpec) -> MachineSpec {
        let host_is_windows_intel =
            host.os == "windows" && matches!(host.arch.as_str(), "x86_64" | "x86");
        let same_identity_with_triplet = self.identifier() == host.identifier() && host.triplet.is_some();
        if host_is_windows_intel || same_identity_with_triplet {
            host.clone()
        } else {
            self.clone()
        }
    }

    fn config_is_optimized(&self) -> bool {
        if self.toolchain_is_msvc() {
            matches!(self.config.as_deref(), Some("md") | Some("mt"))
        } else {
            true
        }
    }

    /// `[-Doptimization=..., -Db_ndebug=...]` for a build-driver `setup` invocation.
    pub fn meson_optimization_options(&self) -> [String; 2] {
        if self.config_is_optimized() {
            [
                "-Doptimization=s".to_string(),
                "-Db_ndebug=true".to_string(),
            ]
        } else {
            [
                "-Doptimization=0".to_string(),
                "-Db_ndebug=false".to_string(),
            ]
        }
    }
}

#[cfg(windows)]
fn detect_windows_native_arch() -> Option<String> {
    // The OS-native-arch API (IsWow64Process2 / GetNativeSystemInfo) is a
    // platform-specific detail out of scope here; the
    // legacy fallback below (platform-info's uname-alike) stands in for it.
    detect_windows_native_arch_legacy()
}

#[cfg(not(windows))]
fn detect_windows_native_arch() -> Option<String> {
    None
}

#[allow(dead_code)]
fn detect_windows_native_arch_legacy() -> Option<String> {
    use platform_info::*;
    let info = PlatformInfo::new().ok()?;
    let machine = info.machine().to_string_lossy().to_lowercase();
    match machine.as_str() {
        "amd64" | "x86_64" => Some("x86_64".to_string()),
        "arm64" | "aarch64" => Some("arm64".to_string()),
        _ => Some("x86".to_string()),
    }
}

/// Parse `raw` and apply [`MachineSpec::default_missing`] with no recommendation.
pub fn parse(raw: &str) -> Result<MachineSpec> {
    MachineSpec::parse(raw).with_context(|| format!("parsing machine spec {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("linux-x86_64", "linux-x86_64")]
    #[case("windows-x86_64-mingw", "windows-x86_64-mingw")]
    #[case("macos-arm64", "macos-arm64")]
    fn identifier_round_trips(#[case] input: &str, #[case] expected: &str) {
        let m = MachineSpec::parse(input).unwrap();
        assert_eq!(m.identifier(), expected);
        // property 1: round trip stability for canonical (non-defaulted) form.
        let reparsed = MachineSpec::parse(&m.identifier()).unwrap();
        assert_eq!(reparsed.identifier(), m.identifier());
    }

    #[test]
    fn gnu_triplet_normalizes_i686_to_x86() {
        let m = MachineSpec::parse("i686-pc-linux-gnu").unwrap();
        assert_eq!(m.arch, "x86");
        assert_eq!(m.os, "linux");
    }

    #[test]
    fn gnu_triplet_detects_musl() {
        let m = MachineSpec::parse("x86_64-unknown-linux-musl").unwrap();
        assert_eq!(m.config.as_deref(), Some("musl"));
    }

    #[test]
    fn gnu_triplet_maps_mingw_kernel() {
        let m = MachineSpec::parse("x86_64-w64-mingw32").unwrap();
        assert_eq!(m.os, "windows");
        assert_eq!(m.config.as_deref(), Some("mingw"));
    }

    #[test]
    fn gnu_triplet_arm_eabihf_becomes_armhf() {
        let m = MachineSpec::parse("arm-unknown-linux-gnueabihf").unwrap();
        assert_eq!(m.arch, "armhf");
    }

    #[test]
    fn gnu_triplet_aarch64_becomes_arm64() {
        let m = MachineSpec::parse("aarch64-unknown-linux-gnu").unwrap();
        assert_eq!(m.arch, "arm64");
    }

    #[test]
    fn windows_msvc_detection() {
        let m = MachineSpec::new("windows", "x86_64", None);
        assert!(m.toolchain_is_msvc());
        assert!(!m.toolchain_can_strip());

        let mingw = MachineSpec::new("windows", "x86_64", Some("mingw".to_string()));
        assert!(!mingw.toolchain_is_msvc());
        assert!(mingw.toolchain_can_strip());
    }

    #[test]
    fn default_missing_fills_msvc_config() {
        let m = MachineSpec::new("windows", "x86_64", None);
        let filled = m.default_missing(None);
        assert_eq!(filled.config.as_deref(), Some("mt"));

        let recommended = m.default_missing(Some("md"));
        assert_eq!(recommended.config.as_deref(), Some("md"));
    }

    #[test]
    fn maybe_adapt_to_host_adopts_windows_intel_host() {
        let generic = MachineSpec::new("windows", "x86_64", None);
        let host = MachineSpec {
            os: "windows".to_string(),
            arch: "x86_64".to_string(),
            config: Some("mt".to_string()),
            triplet: Some("x86_64-pc-windows-msvc".to_string()),
        };
        let adapted = generic.maybe_adapt_to_host(&host);
        assert_eq!(adapted, host);
        assert_eq!(adapted.triplet, host.triplet);
    }

    #[test]
    fn maybe_adapt_to_host_leaves_unrelated_machine_alone() {
        let linux = MachineSpec::new("linux", "x86_64", None);
        let host = MachineSpec::new("windows", "arm64", None);
        // host is windows but not intel, identifiers don't match -> no adoption.
        assert_eq!(linux.maybe_adapt_to_host(&host), linux);
    }

    #[test]
    fn meson_optimization_options_for_msvc_debug_vs_release() {
        let debug = MachineSpec::new("windows", "x86_64", Some("md".to_string()));
        assert_eq!(
            debug.meson_optimization_options(),
            ["-Doptimization=s".to_string(), "-Db_ndebug=true".to_string()]
        );

        let other = MachineSpec::new("windows", "x86_64", Some("debug".to_string()));
        assert_eq!(
            other.meson_optimization_options(),
            ["-Doptimization=0".to_string(), "-Db_ndebug=false".to_string()]
        );
    }

    #[test]
    fn pointer_size_matches_known_table() {
        assert_eq!(MachineSpec::new("linux", "x86_64", None).pointer_size(), 8);
        assert_eq!(MachineSpec::new("linux", "s390x", None).pointer_size(), 8);
        assert_eq!(MachineSpec::new("macos", "arm64", None).pointer_size(), 8);
        assert_eq!(MachineSpec::new("linux", "mips64el", None).pointer_size(), 8);
        assert_eq!(MachineSpec::new("linux", "x86", None).pointer_size(), 4);
        assert_eq!(MachineSpec::new("linux", "armhf", None).pointer_size(), 4);
    }

    #[test]
    fn libdatadir_is_libdata_only_on_freebsd() {
        assert_eq!(MachineSpec::new("freebsd", "x86_64", None).libdatadir(), "libdata");
        assert_eq!(MachineSpec::new("linux", "x86_64", None).libdatadir(), "lib");
    }
}
