//! klp-build - livepatch build orchestration CLI
//!
//! Drives the per-bug livepatch workflow against the build service.
//!
//! ## Commands
//!
//! - `fetch-kernel`: download and unpack the kernel data of each codestream
//! - `push`: create one build project per codestream and commit the patch
//! - `status`: show (or wait for) the build results of the pushed projects
//! - `download`: fetch the built livepatch RPMs
//! - `prepare-tests`: pack the built RPMs into per-architecture test archives
//! - `cleanup`: delete the pushed projects
//! - `log`: print the build log of one codestream and architecture

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use klp_core::{
    BatchReport, CodestreamMap, DownloadPipeline, Identity, NmInspector, PipelineReport,
    Publisher, Registry, Settings, SettingsInput, StatusPoller, SymbolValidator, SystemTools,
    TestBundler,
};
use obs_client::{ObsClient, ObsConfig};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "klp-build")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build and test kernel livepatches across codestreams", long_about = None)]
struct Cli {
    /// Bug number, with or without the `bsc` prefix
    #[arg(long, global = true, default_value = "")]
    bsc: String,

    /// Regex selecting codestreams by identifier, e.g. `15.[34]`
    #[arg(long, global = true)]
    filter: Option<String>,

    /// Directory holding one subdirectory per bug
    #[arg(long, global = true, env = "KLP_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Directory holding the downloaded kernel data
    #[arg(long, global = true, env = "KLP_DATA_DIR")]
    data: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and unpack the kernel packages of every codestream
    FetchKernel,

    /// Push the patch of every codestream to its own build project
    Push {
        /// Wait until every build finished
        #[arg(long)]
        wait: bool,
    },

    /// Show the build results of the pushed projects
    Status {
        /// Keep polling until every build finished
        #[arg(long)]
        wait: bool,
    },

    /// Download the built livepatch RPMs
    Download,

    /// Pack the built livepatch RPMs into test archives
    PrepareTests {
        /// Use the RPMs downloaded earlier
        #[arg(long)]
        skip_download: bool,
    },

    /// Delete the pushed build projects
    Cleanup,

    /// Print the build log of one codestream
    Log {
        /// Codestream identifier, e.g. `15.2u25`
        #[arg(long)]
        cs: String,

        #[arg(long, default_value = klp_core::PRIMARY_ARCH)]
        arch: String,
    },
}

/// Everything a command needs, resolved before the first remote call.
struct Engine {
    settings: Settings,
    registry: Arc<Registry>,
}

impl Engine {
    fn new(cli: &Cli) -> Result<Self> {
        let settings = Settings::resolve(SettingsInput {
            bsc: cli.bsc.clone(),
            filter: cli.filter.clone(),
            work_dir: cli.work_dir.clone(),
            data: cli.data.clone(),
        })
        .context("Invalid settings")?;

        let identity = Identity::from_global_config().context("Failed to read git identity")?;
        let config = ObsConfig::from_env();
        let user = config
            .user
            .clone()
            .unwrap_or_else(|| identity.remote_user().to_string());
        info!("{} <{}> working on {} as {}", identity.name, identity.email, settings.bsc, user);

        let client = ObsClient::new(config).context("Failed to create build service client")?;
        let registry = Arc::new(Registry::new(
            Arc::new(client),
            &user,
            &settings.bsc,
            settings.codestream_filter()?,
        ));
        Ok(Engine { settings, registry })
    }

    fn codestreams(&self) -> &CodestreamMap {
        &self.settings.codestreams
    }

    fn pipeline(&self) -> DownloadPipeline {
        DownloadPipeline::new(
            Arc::clone(&self.registry),
            self.settings.layout(),
            Arc::new(SystemTools),
        )
    }

    fn poller(&self) -> StatusPoller {
        StatusPoller::new(Arc::clone(&self.registry))
    }

    fn publisher(&self) -> Publisher {
        Publisher::new(
            Arc::clone(&self.registry),
            self.settings.layout(),
            &self.settings.bsc,
            &self.settings.patches_dir,
            self.poller(),
        )
    }

    fn bundler(&self) -> TestBundler {
        let tools = Arc::new(SystemTools);
        let validator = SymbolValidator::new(
            Arc::new(NmInspector),
            tools.clone(),
            self.settings.layout(),
        );
        TestBundler::new(
            Arc::clone(&self.registry),
            self.settings.layout(),
            &self.settings.bsc,
            &self.settings.scripts_dir,
            self.settings.test_script(),
            self.pipeline(),
            validator,
            tools,
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    klp_core::init_tracing(cli.json, level);

    let ctx = Engine::new(&cli)?;
    match cli.command {
        Commands::FetchKernel => cmd_fetch_kernel(&ctx).await,
        Commands::Push { wait } => cmd_push(&ctx, wait).await,
        Commands::Status { wait } => cmd_status(&ctx, wait).await,
        Commands::Download => cmd_download(&ctx).await,
        Commands::PrepareTests { skip_download } => cmd_prepare_tests(&ctx, skip_download).await,
        Commands::Cleanup => cmd_cleanup(&ctx).await,
        Commands::Log { cs, arch } => cmd_log(&ctx, &cs, &arch).await,
    }
}

/// Per-task failures were logged as they happened; only the totals are left.
fn summarize(what: &str, report: &BatchReport) {
    if report.is_clean() {
        info!(
            "{}: {} done, {} skipped",
            what, report.done, report.skipped
        );
    } else {
        warn!(
            "{}: {} done, {} skipped, {} failed",
            what,
            report.done,
            report.skipped,
            report.failed.len()
        );
    }
}

async fn cmd_fetch_kernel(ctx: &Engine) -> Result<()> {
    let PipelineReport { downloads, post } = ctx
        .pipeline()
        .fetch_kernel_data(ctx.codestreams())
        .await
        .context("Failed to fetch kernel data")?;
    summarize("downloads", &downloads);
    summarize("extraction", &post);
    Ok(())
}

async fn cmd_push(ctx: &Engine, wait: bool) -> Result<()> {
    let report = ctx
        .publisher()
        .push(ctx.codestreams(), wait)
        .await
        .context("Push failed")?;
    summarize("push", &report);
    Ok(())
}

async fn cmd_status(ctx: &Engine, wait: bool) -> Result<()> {
    let state = ctx
        .poller()
        .run(wait)
        .await
        .context("Failed to query build results")?;
    info!("{} projects finished", state.finished().count());
    Ok(())
}

async fn cmd_download(ctx: &Engine) -> Result<()> {
    let report = ctx
        .pipeline()
        .download_livepatches()
        .await
        .context("Failed to download livepatches")?;
    summarize("download", &report);
    Ok(())
}

async fn cmd_prepare_tests(ctx: &Engine, skip_download: bool) -> Result<()> {
    let archives = ctx
        .bundler()
        .prepare_tests(ctx.codestreams(), skip_download)
        .await
        .context("Failed to prepare tests")?;
    for archive in archives {
        println!("{}", archive.display());
    }
    Ok(())
}

async fn cmd_cleanup(ctx: &Engine) -> Result<()> {
    let report = ctx.publisher().cleanup().await.context("Cleanup failed")?;
    summarize("cleanup", &report);
    Ok(())
}

async fn cmd_log(ctx: &Engine, cs: &str, arch: &str) -> Result<()> {
    let log = ctx
        .publisher()
        .build_log(cs, arch)
        .await
        .with_context(|| format!("Failed to get build log of {cs} on {arch}"))?;
    print!("{log}");
    Ok(())
}
