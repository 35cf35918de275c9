use std::process::ExitCode;

use cask::{
    cli::{CaskArgs, CaskSubcommand},
    config::CaskConfig,
    oci,
    runtime::{ContainerLauncher, ContainerSpec},
    CaskResult,
};
use clap::Parser;
use ipnetwork::Ipv4Network;
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

fn main() -> ExitCode {
    let args = CaskArgs::parse();
    init_tracing(args.verbose);

    match execute(args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Dispatches the parsed arguments.
///
/// `main` stays synchronous and owns the runtime: the pull/assemble/network
/// phases run via `block_on`, while the fork in the launcher happens on this
/// plain thread, never inside the runtime.
fn execute(args: CaskArgs) -> CaskResult<u8> {
    let config = CaskConfig::default();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match args.subcommand {
        CaskSubcommand::Pull { image } => {
            let reference = image.parse()?;
            runtime.block_on(oci::pull_image(&config, &reference))?;
            Ok(0)
        }
        CaskSubcommand::Run {
            mem,
            cpus,
            ip,
            image,
            command,
        } => {
            let spec = ContainerSpec {
                reference: image.parse()?,
                argv: command,
                mem_limit: mem,
                cpu_percent: cpus,
                container_cidr: ip.map(|s| s.parse::<Ipv4Network>()).transpose()?,
            };

            let launcher = ContainerLauncher::new(&config, runtime.handle().clone());
            let code = launcher.run(spec)?;
            Ok(code.clamp(0, 255) as u8)
        }
    }
}

/// Structured logging goes to stderr so container stdout stays clean.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
