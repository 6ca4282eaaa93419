//! Command-line entry point: sync/build/wait prebuilt bundles, or drive a
//! downstream configure step.
//!
//! Run with --help for usage information.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use relkit::{
    machine_spec, params, BuildDriver, BuildRequest, Builder, Bundle, ConfigureRequest,
    Configurator, MachineSpec, Parameters, ProcessBuildDriver, Progress, RelkitError, Synchronizer,
};

const DEFAULT_DEPS_URL: &str = "https://build.frida.re/deps";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BundleArg {
    Toolchain,
    Sdk,
}

impl From<BundleArg> for Bundle {
    fn from(value: BundleArg) -> Self {
        match value {
            BundleArg::Toolchain => Bundle::Toolchain,
            BundleArg::Sdk => Bundle::Sdk,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "relkit", about = "Toolchain/SDK bundling and cross-build orchestration")]
struct Opt {
    /// Root URL the bundle archives are fetched from
    #[arg(long, global = true, default_value = DEFAULT_DEPS_URL)]
    deps_url: String,

    /// Version tag used for the bootstrap toolchain bundle
    #[arg(long, global = true, default_value = "20")]
    bootstrap_version: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch (or confirm up to date) a prebuilt bundle into a directory
    Sync {
        bundle: BundleArg,
        /// Machine the bundle targets, e.g. linux-x86_64
        #[arg(long)]
        machine: Option<String>,
        /// Destination directory
        #[arg(long)]
        location: PathBuf,
        /// Bundle version; defaults to the dependency document's pinned version
        #[arg(long)]
        version: Option<String>,
        /// Directory holding the deps-description document
        #[arg(long, default_value = ".")]
        deps_dir: PathBuf,
    },
    /// Build a bundle from source, per the dependency description document
    Build {
        bundle: BundleArg,
        #[arg(long)]
        build_machine: Option<String>,
        #[arg(long)]
        host_machine: Option<String>,
        #[arg(long)]
        only: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long, default_value = ".")]
        deps_dir: PathBuf,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Poll until a bundle's archive becomes available upstream
    Wait {
        bundle: BundleArg,
        #[arg(long)]
        machine: Option<String>,
        #[arg(long)]
        version: String,
    },
    /// Ensure prebuilt bundles are present and invoke the build driver's setup
    Configure {
        #[arg(long)]
        prefix: PathBuf,
        #[arg(long)]
        host: Option<String>,
        #[arg(long, default_value = "shared")]
        default_library: String,
        #[arg(long)]
        strip: bool,
        #[arg(long, default_value = ".")]
        deps_dir: PathBuf,
        /// Arguments forwarded verbatim to the build driver's setup invocation
        #[arg(last = true)]
        extra_options: Vec<String>,
    },
}

fn resolve_machine(raw: Option<&str>) -> Result<MachineSpec> {
    match raw {
        Some(s) => machine_spec::parse(s),
        None => MachineSpec::detect_local(),
    }
}

fn report_progress(p: Progress) {
    eprintln!("{p}");
}

fn run() -> Result<()> {
    let opt = Opt::parse();
    let synchronizer = Synchronizer::new(opt.deps_url.clone());

    match opt.command {
        Command::Sync {
            bundle,
            machine,
            location,
            version,
            deps_dir,
        } => {
            let bundle: Bundle = bundle.into();
            let machine = resolve_machine(machine.as_deref())?;
            let version = match version {
                Some(v) => v,
                None => {
                    let ctx = params::PredicateContext { bundle, machine: &machine };
                    let params = Parameters::load(&deps_dir, &ctx)?;
                    match bundle {
                        Bundle::Toolchain => opt.bootstrap_version.clone(),
                        Bundle::Sdk => params.deps_version,
                    }
                }
            };
            synchronizer.sync(bundle, &machine, &location, &version, report_progress)?;
        }
        Command::Build {
            bundle,
            build_machine,
            host_machine,
            only,
            exclude,
            deps_dir,
            verbose,
        } => {
            let bundle: Bundle = bundle.into();
            let host_machine = resolve_machine(host_machine.as_deref())?;
            let build_machine = resolve_machine(build_machine.as_deref())?;
            let ctx = params::PredicateContext { bundle, machine: &host_machine };
            let params = Parameters::load(&deps_dir, &ctx)?;

            let driver = ProcessBuildDriver::new("meson");
            let builder = Builder::new(
                deps_dir.clone(),
                Synchronizer::new(opt.deps_url.clone()),
                &driver as &dyn BuildDriver,
                opt.bootstrap_version.clone(),
            );
            let request = BuildRequest {
                bundle,
                build_machine,
                host_machine,
                only: if only.is_empty() { None } else { Some(only) },
                exclude,
                verbose,
            };
            let archive = builder.build(&params, &request, report_progress)?;
            println!("{}", archive.display());
        }
        Command::Wait { bundle, machine, version } => {
            let bundle: Bundle = bundle.into();
            let machine = resolve_machine(machine.as_deref())?;
            synchronizer.wait(bundle, &machine, &version)?;
        }
        Command::Configure {
            prefix,
            host,
            default_library,
            strip,
            deps_dir,
            extra_options,
        } => {
            let host_machine = resolve_machine(host.as_deref())?;
            let build_machine = MachineSpec::detect_local()?;
            let ctx = params::PredicateContext { bundle: Bundle::Sdk, machine: &host_machine };
            let params = Parameters::load(&deps_dir, &ctx)?;

            let driver = ProcessBuildDriver::new("meson");
            let configurator = Configurator::new(
                synchronizer,
                &driver as &dyn BuildDriver,
                opt.bootstrap_version.clone(),
            );
            let request = ConfigureRequest {
                prefix,
                build_machine,
                host_machine,
                allowed_prebuilds: vec![Bundle::Toolchain, Bundle::Sdk],
                default_library,
                strip,
                extra_options,
            };
            configurator.configure(&params, &request, &deps_dir, report_progress)?;
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RELKIT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        if let Some(RelkitError::ChildProcessFailed { stdout, stderr, .. }) = err.downcast_ref::<RelkitError>() {
            if !stdout.is_empty() {
                eprintln!("--- stdout ---\n{stdout}");
            }
            if !stderr.is_empty() {
                eprintln!("--- stderr ---\n{stderr}");
            }
        }
        std::process::exit(1);
    }
}
