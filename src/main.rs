//! prefork - serve HTTP from a group of processes sharing one port.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::{Cli, Commands};
use prefork::logging::{self, LogConfig};
use prefork::{Prefork, PreforkConfig, ProcessRole};

/// Program entry point: parses CLI arguments, dispatches the selected command, and handles top-level errors.
///
/// The coordinator and its workers all run through here with the same
/// arguments; the role is decided inside [`Prefork`].
fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let _process = tracing::info_span!(
        "process",
        pid = std::process::id(),
        role = %ProcessRole::detect()
    )
    .entered();

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::new();

    if cli.quiet {
        config = config.with_filter("error".to_string());
    } else if cli.verbose >= 2 {
        config = config.with_filter("trace".to_string());
    } else if cli.verbose == 1 {
        config = config.with_filter("debug".to_string());
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(ref path) = cli.log_file {
        config = config.with_file(path.clone());
    }

    logging::init(config.with_env_overrides());
}

/// Runs the demo application as a prefork group, with TLS when a certificate is given.
fn cmd_serve(args: &cli::ServeArgs) -> Result<()> {
    let server = Prefork::new(prefork::app::build_router()).with_config(PreforkConfig {
        workers: args.workers.map(usize::from),
    });

    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = prefork::tls::server_config_from_pem(cert, key)?;
            server
                .run_tls(&args.addr, tls)
                .with_context(|| format!("Failed to serve TLS on {}", args.addr))?;
        }
        _ => {
            server
                .run(&args.addr)
                .with_context(|| format!("Failed to serve on {}", args.addr))?;
        }
    }

    Ok(())
}
