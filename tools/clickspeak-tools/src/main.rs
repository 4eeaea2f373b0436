use std::{path::PathBuf, process::ExitCode};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use clickspeak_core::{
    identity::CLICKSPEAK,
    paths::{self, BOOTSTRAP_PYTHON_ENV, PROJECT_DIR_ENV, RUNTIME_DIR_ENV},
    RuntimeInstallation,
};
use clickspeak_observability::{safe_eprintln, Tracer};
use clickspeak_tools::{
    bundle::{self, BundleMode, BundleRequest},
    compile::CargoBuilder,
    provision::{self, ProvisionOutcome, ProvisionRequest},
    sign::{Codesign, ADHOC_IDENTITY},
    status::{self, InstallStatus},
    TRACE_COMPONENT,
};

#[derive(Debug, Parser)]
#[command(name = "clickspeak-tools", version, about = "Install pipeline for ClickSpeak")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Create or rebuild the isolated Python runtime.
    Provision(ProvisionArgs),
    /// Compile the launcher and write the signed app bundle.
    Bundle(BundleArgs),
    /// Provision, bundle, then smoke-test the installed app.
    Install(InstallArgs),
    /// Print runtime and bundle readiness as JSON.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
struct LocationArgs {
    #[arg(long, env = RUNTIME_DIR_ENV)]
    runtime_dir: Option<PathBuf>,
    /// Project checkout; probed under $HOME when omitted.
    #[arg(long, env = PROJECT_DIR_ENV)]
    project: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    #[command(flatten)]
    location: LocationArgs,
    /// Host interpreter to build the runtime from.
    #[arg(long, env = BOOTSTRAP_PYTHON_ENV)]
    python: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct BundleArgs {
    #[command(flatten)]
    location: LocationArgs,
    #[arg(long, value_enum, default_value_t = BundleMode::Dev)]
    mode: BundleMode,
    #[arg(long, default_value = "/Applications")]
    apps_dir: PathBuf,
    #[arg(long, env = "CLICKSPEAK_SIGN_IDENTITY", default_value = ADHOC_IDENTITY)]
    sign_identity: String,
    /// Workspace containing the launcher crate.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct InstallArgs {
    #[command(flatten)]
    bundle: BundleArgs,
    #[arg(long, env = BOOTSTRAP_PYTHON_ENV)]
    python: Option<PathBuf>,
    #[arg(long)]
    skip_smoke_test: bool,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long, env = RUNTIME_DIR_ENV)]
    runtime_dir: Option<PathBuf>,
    #[arg(long, default_value = "/Applications")]
    apps_dir: PathBuf,
}

struct Session {
    home: PathBuf,
    tracer: Tracer,
}

impl Session {
    fn load() -> Result<Self> {
        let home = paths::home_dir()?;
        let tracer = Tracer::new(paths::data_dir_from_env(&home), TRACE_COMPONENT);
        Ok(Self { home, tracer })
    }

    fn runtime(&self, override_dir: Option<PathBuf>) -> RuntimeInstallation {
        RuntimeInstallation::at(paths::resolve_runtime_dir(&self.home, override_dir))
    }

    fn project(&self, override_dir: Option<PathBuf>) -> Option<PathBuf> {
        paths::resolve_project_dir(&self.home, override_dir, true)
    }

    fn require_project(&self, override_dir: Option<PathBuf>) -> Result<PathBuf> {
        self.project(override_dir).ok_or_else(|| {
            anyhow!(
                "E_PROJECT_NOT_FOUND: no checkout with {} under {} (tried {}); pass --project or set {PROJECT_DIR_ENV}",
                paths::PROJECT_MARKER,
                self.home.display(),
                paths::PROJECT_CANDIDATES.join(", ")
            )
        })
    }
}

fn provision_cmd(ctx: &Session, location: LocationArgs, python: Option<PathBuf>) -> Result<()> {
    let runtime = ctx.runtime(location.runtime_dir);
    let project = ctx.require_project(location.project)?;
    let req = ProvisionRequest {
        runtime,
        project,
        bootstrap_override: python,
        search_dirs: provision::default_search_dirs(std::env::var_os("PATH").as_ref()),
    };
    println!("runtime: {}", req.runtime.root().display());
    match provision::ensure_runtime(&req, &ctx.tracer)? {
        ProvisionOutcome::AlreadyReady => {
            println!("runtime already ready (Python {})", req.runtime.required_version())
        }
        ProvisionOutcome::Rebuilt { bootstrap } => {
            println!("runtime rebuilt from {}", bootstrap.display())
        }
    }
    Ok(())
}

fn bundle_cmd(ctx: &Session, args: BundleArgs) -> Result<bundle::BundleLayout> {
    let runtime = ctx.runtime(args.location.runtime_dir);
    let project = ctx.project(args.location.project);
    let target = bundle::canonical_bundle(&args.apps_dir, &CLICKSPEAK);
    let req = BundleRequest {
        bundle: target,
        legacy: bundle::legacy_bundles(&args.apps_dir, Some(&ctx.home), &CLICKSPEAK),
        mode: args.mode,
        project,
        runtime: &runtime,
        identity: &CLICKSPEAK,
    };
    let builder = CargoBuilder::new(
        args.workspace
            .unwrap_or_else(CargoBuilder::source_workspace_root),
    );
    let signer = Codesign::new(args.sign_identity);
    let report = bundle::write_bundle(&req, &builder, &signer, &ctx.tracer)?;
    for old in &report.removed_legacy {
        println!("removed legacy bundle {}", old.display());
    }
    println!(
        "bundle: {} ({:?}, {} link, signed as {})",
        report.layout.root().display(),
        report.receipt.mode,
        report.receipt.link_shape,
        signer.identity()
    );
    Ok(report.layout)
}

fn install_cmd(ctx: &Session, args: InstallArgs) -> Result<()> {
    provision_cmd(
        ctx,
        LocationArgs {
            runtime_dir: args.bundle.location.runtime_dir.clone(),
            project: args.bundle.location.project.clone(),
        },
        args.python,
    )?;
    let layout = bundle_cmd(ctx, args.bundle)?;
    if args.skip_smoke_test {
        return Ok(());
    }
    println!("smoke test: {} {}", layout.executable().display(), bundle::SMOKE_TEST_ARG);
    bundle::smoke_test(&layout).context("installed launcher failed its smoke test")
}

fn status_cmd(ctx: &Session, args: StatusArgs) -> Result<()> {
    let runtime = ctx.runtime(args.runtime_dir);
    let report = InstallStatus {
        runtime: status::runtime_status(&runtime),
        bundle: status::bundle_status(
            &bundle::canonical_bundle(&args.apps_dir, &CLICKSPEAK),
            &CLICKSPEAK,
        ),
    };
    let s = serde_json::to_string_pretty(&report).context("serialize status failed")?;
    println!("{s}");
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let ctx = Session::load()?;
    match cli.cmd {
        Cmd::Provision(a) => provision_cmd(&ctx, a.location, a.python),
        Cmd::Bundle(a) => bundle_cmd(&ctx, a).map(|_| ()),
        Cmd::Install(a) => install_cmd(&ctx, a),
        Cmd::Status(a) => status_cmd(&ctx, a),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            safe_eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
