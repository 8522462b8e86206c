use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;

use crate::config::{Config, Overrides};
use crate::{fetch, observability, run};

/// Synthetic load generator for key-value serving tiers.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Fetch(FetchCommand),
    Version(VersionCommand),
}

/// send requests to the target until interrupted
///
/// Options given here take precedence over the configuration file and the environment.
#[derive(Debug, Default, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// address of the target, optionally prefixed with `name=`
    #[argh(option)]
    target: Option<String>,

    /// address of a second target to mirror requests to and compare responses with
    #[argh(option)]
    diff: Option<String>,

    /// name of the collection to request
    #[argh(option)]
    collection: Option<String>,

    /// number of concurrent workers
    #[argh(option)]
    workers: Option<usize>,

    /// requests per second to attempt
    #[argh(option)]
    qps: Option<u32>,

    /// number of random keys to sample requests from
    #[argh(option)]
    sample_size: Option<u64>,
}

impl RunCommand {
    fn overrides(&self) -> Overrides {
        Overrides {
            target: self.target.clone(),
            diff: self.diff.clone(),
            collection: self.collection.clone(),
            workers: self.workers,
            rate: self.qps,
            sample_size: self.sample_size,
        }
    }
}

/// resolve collection descriptors and copy remote collections to the local cache
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "fetch")]
struct FetchCommand {
    /// URL of the collection descriptor document
    #[argh(option)]
    url: String,
}

/// print the kvload version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("kvload {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let overrides = match &args.command {
        Command::Run(command) => command.overrides(),
        Command::Fetch(_) | Command::Version(_) => Overrides::default(),
    };
    let config = Config::load_with(args.config.as_deref(), &overrides)?;

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("kvload-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads.max(1))
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    let metrics_guard = observability::init_metrics(&config)?;

    let result = runtime.block_on(async move {
        match args.command {
            Command::Run(_) => run::run(config).await,
            Command::Fetch(FetchCommand { url }) => print_collections(&url, &config).await,
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    });

    // Flush metrics unconditionally before shutdown, even on error.
    runtime.block_on(async {
        if let Some(metrics_guard) = metrics_guard {
            metrics_guard.flush(None).await.ok();
        }
    });

    result
}

async fn print_collections(url: &str, config: &Config) -> Result<()> {
    let collections = fetch::load_from_url(url, &config.fetch).await?;
    for collection in collections {
        println!("{}\t{}", collection.name, collection.path);
    }
    Ok(())
}
