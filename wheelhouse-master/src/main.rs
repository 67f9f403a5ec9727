use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wheelhouse_master::boot;

/// Command line arguments for the wheelhouse master daemon.
#[derive(Parser, Debug)]
#[command(name = "wheelhouse-master")]
#[command(about = "Build farm master for pre-compiled wheel distribution")]
struct Args {
    /// Path to the master configuration file
    #[arg(short, long, env = "WHEELHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Postgres connection URL (overrides config)
    #[arg(long, env = "WHEELHOUSE_DATABASE_URL")]
    database_url: Option<String>,

    /// Root of the published wheel tree (overrides config)
    #[arg(long, env = "WHEELHOUSE_OUTPUT_ROOT")]
    output_root: Option<PathBuf>,

    /// Upstream index URL (overrides config)
    #[arg(long, env = "WHEELHOUSE_INDEX_URL")]
    index_url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match wheelhouse_config::load(args.config.as_deref())
    {
        Ok(config) => config,
        Err(err) => {
            eprintln!("wheelhouse-master: {err}");
            return ExitCode::from(2);
        }
    };
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Some(root) = args.output_root {
        config.paths.output_root = root;
    }
    if let Some(url) = args.index_url {
        config.upstream.index_url = url;
    }
    if let Err(err) = config.validate() {
        eprintln!("wheelhouse-master: {err}");
        return ExitCode::from(2);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "wheelhouse_master=info,wheelhouse_core=info".into()
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match boot::run(config, args.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "master failed");
            ExitCode::from(1)
        }
    }
}
