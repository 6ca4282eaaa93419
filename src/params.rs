//! Declarative dependency-description document: typed records plus the
//! small predicate language used for conditional inclusion.
//!
//! The document is read with `toml`/`serde` for the common case (load once,
//! produce typed records) and mutated in place with `toml_edit` for the
//! narrow set of writes that must preserve the surrounding formatting.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use fs_err as fs;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::RelkitError;
use crate::machine_spec::MachineSpec;

/// Which of the two bundle kinds a package/option/dependency applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bundle {
    Toolchain,
    Sdk,
}

impl Bundle {
    pub fn name(&self) -> &'static str {
        match self {
            Bundle::Toolchain => "toolchain",
            Bundle::Sdk => "sdk",
        }
    }
}

/// Which machine (the one that runs the build tools, or the one the
/// output runs on) a dependency applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForMachine {
    Host,
    Build,
}

/// The context a [`When`] predicate is evaluated against.
pub struct PredicateContext<'a> {
    pub bundle: Bundle,
    pub machine: &'a MachineSpec,
}

/// A small tagged-union predicate AST loaded straight from the TOML
/// document: no arbitrary expression evaluation, just
/// comparisons and set membership over a fixed attribute vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum When {
    All { all: Vec<When> },
    Any { any: Vec<When> },
    Not { not: Box<When> },
    Eq { eq: (String, String) },
    In { r#in: (String, Vec<String>) },
}

impl When {
    pub fn evaluate(&self, ctx: &PredicateContext<'_>) -> Result<bool> {
        Ok(match self {
            When::All { all } => all.iter().try_fold(true, |acc, w| -> Result<bool> {
                Ok(acc && w.evaluate(ctx)?)
            })?,
            When::Any { any } => any.iter().try_fold(false, |acc, w| -> Result<bool> {
                Ok(acc || w.evaluate(ctx)?)
            })?,
            When::Not { not } => !not.evaluate(ctx)?,
            When::Eq { eq: (attr, value) } => attribute(ctx, attr)? == *value,
            When::In { r#in: (attr, values) } => {
                let actual = attribute(ctx, attr)?;
                values.iter().any(|v| *v == actual)
            }
        })
    }
}

/// Resolve one of the fixed attributes a predicate may reference.
fn attribute(ctx: &PredicateContext<'_>, attr: &str) -> Result<String> {
    Ok(match attr {
        "bundle" => ctx.bundle.name().to_string(),
        "machine.os" => ctx.machine.os.clone(),
        "machine.arch" => ctx.machine.arch.clone(),
        "machine.config" => ctx.machine.config.clone().unwrap_or_default(),
        "machine.identifier" => ctx.machine.identifier(),
        _ => bail!(RelkitError::ConfigError(format!(
            "unknown predicate attribute {attr:?}"
        ))),
    })
}

/// Evaluate an optional predicate, defaulting to `true` when absent.
fn eval_opt(when: &Option<When>, ctx: &PredicateContext<'_>) -> Result<bool> {
    match when {
        Some(w) => w.evaluate(ctx),
        None => Ok(true),
    }
}

/// An `options = [...]` entry: either a bare string or `{ value, when }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionEntry {
    Bare(String),
    Conditional { value: String, when: Option<When> },
}

/// A resolved package option after `when` filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Option_ {
    pub value: String,
}

impl OptionEntry {
    fn value(&self) -> &str {
        match self {
            OptionEntry::Bare(v) => v,
            OptionEntry::Conditional { value, .. } => value,
        }
    }

    fn when(&self) -> &Option<When> {
        static NONE: Option<When> = None;
        match self {
            OptionEntry::Bare(_) => &NONE,
            OptionEntry::Conditional { when, .. } => when,
        }
    }
}

/// A `dependencies = [...]` entry: either a bare package id or a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyEntry {
    Bare(String),
    Full {
        id: String,
        #[serde(default = "default_for_machine")]
        for_machine: ForMachine,
        when: Option<When>,
    },
}

fn default_for_machine() -> ForMachine {
    ForMachine::Host
}

/// A resolved dependency edge after `when` filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub identifier: String,
    pub for_machine: ForMachine,
}

impl DependencyEntry {
    fn identifier(&self) -> &str {
        match self {
            DependencyEntry::Bare(id) => id,
            DependencyEntry::Full { id, .. } => id,
        }
    }

    fn for_machine(&self) -> ForMachine {
        match self {
            DependencyEntry::Bare(_) => ForMachine::Host,
            DependencyEntry::Full { for_machine, .. } => *for_machine,
        }
    }

    fn when(&self) -> &Option<When> {
        static NONE: Option<When> = None;
        match self {
            DependencyEntry::Bare(_) => &NONE,
            DependencyEntry::Full { when, .. } => when,
        }
    }
}

/// Raw, as-deserialized shape of a `[<pkg_id>]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPackage {
    name: String,
    version: String,
    url: String,
    #[serde(default)]
    options: Vec<OptionEntry>,
    #[serde(default)]
    dependencies: Vec<DependencyEntry>,
    scope: Option<String>,
    when: Option<When>,
}

/// A single buildable unit: git URL, pinned commit, options, dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub identifier: String,
    pub name: String,
    pub display_url: String,
    pub version: String,
    pub options: Vec<Option_>,
    pub dependencies: Vec<Dependency>,
    pub scope: Option<String>,
}

impl Package {
    fn from_raw(identifier: &str, raw: &RawPackage, ctx: &PredicateContext<'_>) -> Result<Self> {
        let included = eval_opt(&raw.when, ctx)
            .with_context(|| format!("evaluating `when` for package {identifier:?}"))?;
        if !included {
            return Ok(Package {
                identifier: identifier.to_string(),
                name: raw.name.clone(),
                display_url: raw.url.clone(),
                version: raw.version.clone(),
                options: Vec::new(),
                dependencies: Vec::new(),
                scope: raw.scope.clone(),
            });
        }

        let mut options = Vec::new();
        for entry in &raw.options {
            if eval_opt(entry.when(), ctx)? {
                options.push(Option_ {
                    value: entry.value().to_string(),
                });
            }
        }

        let mut dependencies = Vec::new();
        for entry in &raw.dependencies {
            if eval_opt(entry.when(), ctx)? {
                dependencies.push(Dependency {
                    identifier: entry.identifier().to_string(),
                    for_machine: entry.for_machine(),
                });
            }
        }

        Ok(Package {
            identifier: identifier.to_string(),
            name: raw.name.clone(),
            display_url: raw.url.clone(),
            version: raw.version.clone(),
            options,
            dependencies,
            scope: raw.scope.clone(),
        })
    }

    /// Whether the package itself is live under `ctx` (distinct from its
    /// options/dependencies, which are filtered independently).
    pub fn is_included(raw_when: &Option<When>, ctx: &PredicateContext<'_>) -> Result<bool> {
        eval_opt(raw_when, ctx)
    }
}

#[derive(Debug, Deserialize)]
struct DependenciesSection {
    version: String,
    bootstrap_version: String,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    dependencies: DependenciesSection,
    #[serde(flatten)]
    packages: BTreeMap<String, RawPackage>,
}

/// The fully loaded dependency-description document.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub deps_version: String,
    pub bootstrap_version: String,
    pub packages: IndexMap<String, Package>,
    raw_packages: IndexMap<String, RawPackage>,
}

impl Parameters {
    /// Load from the fixed `deps-description` filename under `dir`, resolving
    /// `when` against `ctx`.
    pub fn load(dir: &Path, ctx: &PredicateContext<'_>) -> Result<Self> {
        let path = dir.join("deps-description");
        Self::load_from_path(&path, ctx)
    }

    pub fn load_from_path(path: &Path, ctx: &PredicateContext<'_>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading dependency description at {}", path.display()))?;
        Self::parse(&contents, ctx)
    }

    pub fn parse(contents: &str, ctx: &PredicateContext<'_>) -> Result<Self> {
        let raw: RawDocument = toml::from_str(contents)
            .map_err(|e| RelkitError::ConfigError(e.to_string()))
            .context("parsing dependency description")?;

        let mut packages = IndexMap::new();
        for (id, raw_pkg) in &raw.packages {
            if !Package::is_included(&raw_pkg.when, ctx)? {
                continue;
            }
            let pkg = Package::from_raw(id, raw_pkg, ctx)?;
            if &pkg.identifier != id {
                bail!(RelkitError::ConfigError(format!(
                    "package key {id:?} does not match its own identifier"
                )));
            }
            packages.insert(id.clone(), pkg);
        }

        let raw_packages = raw.packages.into_iter().collect();

        Ok(Parameters {
            deps_version: raw.dependencies.version,
            bootstrap_version: raw.dependencies.bootstrap_version,
            packages,
            raw_packages,
        })
    }

    /// Mutate `dependencies.bootstrap_version` in place, leaving every other
    /// byte of the document untouched (comments, ordering, spacing).
    pub fn set_bootstrap_version(path: &Path, version: &str) -> Result<()> {
        set_toml_key(path, &["dependencies", "bootstrap_version"], version)
    }

    /// Mutate `<pkg_id>.version` in place via the same format-preserving path.
    pub fn set_package_version(path: &Path, pkg_id: &str, commit: &str) -> Result<()> {
        set_toml_key(path, &[pkg_id, "version"], commit)
    }
}

fn set_toml_key(path: &Path, table_path: &[&str], value: &str) -> Result<()> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading dependency description at {}", path.display()))?;
    let mut doc = contents
        .parse::<toml_edit::DocumentMut>()
        .map_err(|e| RelkitError::ConfigError(e.to_string()))
        .context("parsing dependency description for in-place edit")?;

    let (table_names, leaf) = table_path.split_at(table_path.len() - 1);
    let mut table = doc.as_table_mut() as &mut dyn toml_edit::TableLike;
    for name in table_names {
        table = table
            .get_mut(name)
            .and_then(|item| item.as_table_like_mut())
            .ok_or_else(|| RelkitError::ConfigError(format!("missing table {name:?}")))?;
    }
    table.insert(leaf[0], toml_edit::value(value));

    fs::write(path, doc.to_string())
        .with_context(|| format!("writing dependency description at {}", path.display()))?;
    Ok(())
}
