//! GG-DEPLOY entry point.
//!
//! ## CLI Subcommands
//!
//! - `gg-deploy plan <manifest>` - Build and print a deploy plan
//! - `gg-deploy inspect <model>` - Parse a model container
//! - `gg-deploy pack <desc> <out>` - Write a model container
//! - `gg-deploy deploy <manifest>` - Deploy on an in-process cluster
//! - `gg-deploy config show|defaults|validate`

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use gg_deploy::cli::{self, config_cmd, deploy_cmd, inspect_cmd, pack_cmd, plan_cmd};
use gg_deploy::config::DeployConfig;
use gg_deploy::telemetry;

const DEFAULT_INSPECT_CHUNK: usize = 64 * 1024;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");
    let json = args.iter().any(|a| a == "--json");

    match command {
        "plan" => {
            let Some(manifest) = positional(&args, 2) else {
                print_command_help("plan");
                return ExitCode::from(2u8);
            };
            let Some(config) = startup() else {
                return ExitCode::from(2u8);
            };
            exit(plan_cmd::run_plan(&manifest, json, &config))
        }
        "inspect" => {
            let Some(model) = positional(&args, 2) else {
                print_command_help("inspect");
                return ExitCode::from(2u8);
            };
            let chunk = flag_value(&args, "--chunk")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(DEFAULT_INSPECT_CHUNK);
            exit(inspect_cmd::run_inspect(&model, chunk, json))
        }
        "pack" => {
            let (Some(spec), Some(out)) = (positional(&args, 2), positional(&args, 3)) else {
                print_command_help("pack");
                return ExitCode::from(2u8);
            };
            exit(pack_cmd::run_pack(&spec, &out))
        }
        "deploy" => {
            let Some(manifest) = positional(&args, 2) else {
                print_command_help("deploy");
                return ExitCode::from(2u8);
            };
            let feeds = match deploy_cmd::parse_feeds(&args[2..]) {
                Ok(feeds) => feeds,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::from(2u8);
                }
            };
            let Some(config) = startup() else {
                return ExitCode::from(2u8);
            };
            exit(deploy_cmd::run_deploy(&manifest, feeds, &config).await)
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => exit(config_cmd::run_show(json)),
                "defaults" => exit(config_cmd::run_defaults()),
                "validate" => exit(config_cmd::run_validate()),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            match args.get(2) {
                Some(subcommand) => print_command_help(subcommand),
                None => print_usage(),
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("gg-deploy {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// Load configuration and install logging. `None` means a config error was
/// already reported.
fn startup() -> Option<DeployConfig> {
    let config = match cli::load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            return None;
        }
    };
    if let Err(e) = telemetry::init_logging(&config.log) {
        eprintln!("Logging disabled: {}", e);
    }
    Some(config)
}

/// The `index`-th argument, skipping flags and their values.
fn positional(args: &[String], index: usize) -> Option<PathBuf> {
    let mut seen = 1;
    let mut iter = args.iter().enumerate().skip(1);
    while let Some((_, arg)) = iter.next() {
        if arg == "--chunk" || arg == "--feed" {
            iter.next();
            continue;
        }
        if arg.starts_with("--") {
            continue;
        }
        if seen == index {
            return Some(Path::new(arg).to_path_buf());
        }
        seen += 1;
    }
    None
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "gg-deploy - heterogeneous submodel deployment v{}

USAGE:
    gg-deploy <COMMAND> [OPTIONS]

COMMANDS:
    plan       Build the deploy plan for a manifest
    inspect    Parse a model container and summarize it
    pack       Write a model container from a JSON description
    deploy     Deploy a manifest on an in-process cluster
    config     Show or validate configuration
    version    Show version information
    help       Show this help message

OPTIONS:
    --json     Machine-readable output (plan, inspect, config show)

ENVIRONMENT:
    GG_DEPLOY_CONFIG     TOML config file
    GG_DEPLOY_LOG_LEVEL  Log filter (e.g. info, gg_deploy::daemon=debug)
    GG_DEPLOY_*          See `gg-deploy config show`

EXIT CODES:
    0  Success
    1  Failure
    2  Usage or configuration error
",
        version
    );
}

fn print_command_help(command: &str) {
    match command {
        "plan" => eprintln!(
            "gg-deploy plan - Build a deploy plan

USAGE:
    gg-deploy plan <MANIFEST> [--json]

DESCRIPTION:
    Loads the deployment manifest, flattens nested submodels, replicates
    them across the listed devices and prints the queues, bindings and
    submodel placements. Artifact paths resolve relative to the manifest.
"
        ),
        "inspect" => eprintln!(
            "gg-deploy inspect - Parse a model container

USAGE:
    gg-deploy inspect <MODEL> [--chunk BYTES] [--json]

DESCRIPTION:
    Memory-maps the file and feeds it to the incremental parser in
    chunks (default 65536 bytes), then prints every contained model.
"
        ),
        "pack" => eprintln!(
            "gg-deploy pack - Write a model container

USAGE:
    gg-deploy pack <DESCRIPTION.json> <OUT>

DESCRIPTION:
    Serializes the models of a JSON description. Weights and kernel
    binaries are given as hex strings.
"
        ),
        "deploy" => eprintln!(
            "gg-deploy deploy - Deploy on an in-process cluster

USAGE:
    gg-deploy deploy <MANIFEST> [--feed NAME=HEX]...

DESCRIPTION:
    Starts one daemon per manifest device, deploys with the identity
    backend, feeds the given payloads, fetches one result per root
    output, prints metrics and undeploys.
"
        ),
        "config" => eprintln!(
            "gg-deploy config - Configuration

USAGE:
    gg-deploy config show [--json]
    gg-deploy config defaults
    gg-deploy config validate
"
        ),
        _ => print_usage(),
    }
}
