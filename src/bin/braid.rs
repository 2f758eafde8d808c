//! braid binary.
//!
//! Usage: braid [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a starting-point configuration
//!   -h, --help           Print help information

use std::env;

use braid::{ConfigFile, Proxy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_proxy(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"braid - circuit-multiplexing obfuscation proxy

USAGE:
    braid [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Print a starting-point configuration
    -h, --help              Print help information

EXAMPLES:
    Generate a configuration to edit:
        braid --generate > braid.toml

    Run the client end:
        braid --config braid.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    println!("# braid configuration");
    println!("# role: \"client\" listens on `upstream` and dials every downstream;");
    println!("# role: \"server\" listens on every downstream and dials `upstream`.");
    println!();
    println!("{}", toml::to_string_pretty(&ConfigFile::example())?);
    Ok(())
}

async fn run_proxy(config_path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(config_path)?;
    let file: ConfigFile = toml::from_str(&content)?;
    let config = file.to_config().map_err(|e: String| anyhow::anyhow!(e))?;

    // Respects RUST_LOG; the `trace` toggle raises the default level.
    let default_filter = if config.trace { "braid=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    tracing::info!(
        "starting braid {:?} with {} downstream link(s)",
        config.role,
        config.downstreams.len()
    );

    let proxy = Proxy::new(config);
    proxy.run().await?;
    Ok(())
}
