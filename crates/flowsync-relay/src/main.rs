//! `flowsync-relay`: TCP relay, convergence simulator and version report

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use flowsync_core::{ConfigLoader, SyncConfig};
use flowsync_relay::{run_simulator, SimulatorConfig, VersionReport};
use flowsync_transport::RelayServer;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn cli() -> Command {
    Command::new("flowsync-relay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relay and convergence simulator for collaborative flow editing")
        .subcommand_required(true)
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the TCP relay")
                .arg(
                    Arg::new("listen")
                        .long("listen")
                        .value_name("ADDR")
                        .help("Address to listen on (defaults to the configured relay address)"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_name("FILE")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML configuration file"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a seeded convergence simulation over the memory hub")
                .arg(
                    Arg::new("replicas")
                        .long("replicas")
                        .default_value("3")
                        .value_parser(value_parser!(u16).range(1..))
                        .help("Number of replicas"),
                )
                .arg(
                    Arg::new("operations")
                        .long("operations")
                        .default_value("200")
                        .value_parser(value_parser!(u64))
                        .help("Number of mutations to simulate"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("drop-rate")
                        .long("drop-rate")
                        .default_value("0.1")
                        .value_parser(parse_rate)
                        .help("Probability that a message is lost"),
                )
                .arg(
                    Arg::new("duplicate-rate")
                        .long("duplicate-rate")
                        .default_value("0.1")
                        .value_parser(parse_rate)
                        .help("Probability that a message is delivered twice"),
                )
                .arg(
                    Arg::new("max-delay-ms")
                        .long("max-delay-ms")
                        .default_value("10")
                        .value_parser(value_parser!(u64))
                        .help("Upper bound for injected delivery delay"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("report")
                .about("Print version information")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
}

fn parse_rate(value: &str) -> Result<f64, String> {
    let rate: f64 = value.parse().map_err(|_| format!("'{value}' is not a number"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{rate} is not between 0 and 1"))
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn serve(args: &ArgMatches) -> anyhow::Result<()> {
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => ConfigLoader::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ConfigLoader::from_env().context("invalid environment configuration")?,
    };
    let listen = args
        .get_one::<String>("listen")
        .cloned()
        .unwrap_or_else(|| config.relay_addr.clone());

    let server = RelayServer::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    let core = server.core();

    server
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let stats = core.stats();
    info!(
        connections = stats.connections,
        changes = stats.changes_stored,
        forwarded = stats.changes_forwarded,
        "relay stopped"
    );
    Ok(())
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = SimulatorConfig {
        seed: *args.get_one::<u64>("seed").context("missing --seed")?,
        replicas: usize::from(*args.get_one::<u16>("replicas").context("missing --replicas")?),
        operations: *args.get_one::<u64>("operations").context("missing --operations")?,
        drop_rate: *args.get_one::<f64>("drop-rate").context("missing --drop-rate")?,
        duplicate_rate: *args
            .get_one::<f64>("duplicate-rate")
            .context("missing --duplicate-rate")?,
        max_delay_ms: *args.get_one::<u64>("max-delay-ms").context("missing --max-delay-ms")?,
        ..SimulatorConfig::default()
    };

    let report = run_simulator(config).await;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.generate_text());
    }
    Ok(report.passed())
}

fn report(args: &ArgMatches) -> anyhow::Result<()> {
    let report = VersionReport::current();
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.generate_text());
        println!("  default config:");
        print!("{}", config_defaults()?);
    }
    Ok(())
}

fn config_defaults() -> anyhow::Result<String> {
    let json = serde_json::to_value(SyncConfig::default())?;
    let mut out = String::new();
    if let serde_json::Value::Object(map) = json {
        for (key, value) in map {
            if !value.is_object() && !value.is_null() {
                out.push_str(&format!("    {key} = {value}\n"));
            }
        }
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("serve", args)) => serve(args).await,
        Some(("simulate", args)) => {
            let passed = simulate(args).await?;
            std::process::exit(if passed { 0 } else { 1 });
        }
        Some(("report", args)) => report(args),
        _ => unreachable!("subcommand_required is set"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn parses_simulate_args() {
        let matches = cli()
            .try_get_matches_from([
                "flowsync-relay",
                "simulate",
                "--replicas",
                "5",
                "--drop-rate",
                "0.25",
            ])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "simulate");
        assert_eq!(args.get_one::<u16>("replicas"), Some(&5));
        assert_eq!(args.get_one::<f64>("drop-rate"), Some(&0.25));
        assert_eq!(args.get_one::<u64>("seed"), Some(&42));
    }

    #[test]
    fn rejects_bad_rates() {
        assert!(parse_rate("1.5").is_err());
        assert!(parse_rate("abc").is_err());
        assert_eq!(parse_rate("0"), Ok(0.0));
    }

    #[test]
    fn rejects_zero_replicas() {
        assert!(cli()
            .try_get_matches_from(["flowsync-relay", "simulate", "--replicas", "0"])
            .is_err());
    }
}
