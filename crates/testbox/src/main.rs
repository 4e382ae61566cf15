use std::collections::BTreeMap;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info, warn};

use testbox::container::ContainerError;
use testbox::provider::{Container, ContainerRequest, DockerProvider};
use testbox::settings::{self, Settings};
use testbox::wait::ForListeningPort;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Disposable test containers guarded by a reaper sidecar")]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true, env = "TESTBOX_CONFIG")]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a container under reaper coverage until Ctrl-C
    Run(RunCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// Image to run
    image: String,
    /// Port to expose, e.g. `80/tcp` or `127.0.0.1:8080:80`
    #[arg(short = 'p', long = "publish", value_name = "SPEC")]
    ports: Vec<String>,
    /// Environment variable for the container
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Command override
    #[arg(long)]
    cmd: Option<String>,
    /// Wait until this port accepts TCP connections
    #[arg(long, value_name = "PORT")]
    wait_port: Option<String>,
    /// Readiness deadline in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    wait_timeout: u64,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

struct RuntimeContext {
    common: CommonOpts,
    settings: Settings,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let settings = Settings::load(common.config.as_deref()).context("loading configuration")?;
        Ok(Self { common, settings })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("testbox={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let disable_color =
                std::env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.verbose > 1),
                )
                .try_init()
                .ok();
        }

        Ok(())
    }

    fn effective_log_level(&self) -> String {
        if self.common.quiet {
            return "error".to_string();
        }
        match self.common.verbose {
            0 => self.settings.logging.level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("effective settings: {:?}", ctx.settings);

    match cli.command {
        Command::Run(cmd) => async_run(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
    }
}

#[tokio::main]
async fn async_run(ctx: RuntimeContext, cmd: RunCommand) -> Result<()> {
    handle_run(&ctx, cmd).await
}

fn build_request(cmd: &RunCommand) -> Result<ContainerRequest> {
    let mut request = ContainerRequest::new(&cmd.image);

    for spec in &cmd.ports {
        request = request.with_exposed_port(spec);
    }

    for pair in &cmd.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --env '{pair}', expected KEY=VALUE"))?;
        request = request.with_env(key, value);
    }

    if let Some(command) = &cmd.cmd {
        request = request.with_cmd(command);
    }

    if let Some(port) = &cmd.wait_port {
        request = request.with_wait_strategy(
            ForListeningPort::new(port).with_timeout(Duration::from_secs(cmd.wait_timeout)),
        );
    }

    Ok(request)
}

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<()> {
    let request = build_request(&cmd)?;
    let provider = DockerProvider::from_settings(&ctx.settings);
    info!(session = %provider.session(), image = %cmd.image, "running container");

    let container = match provider.run_container(&request).await {
        Ok(container) => container,
        Err(err) => {
            if let Some(container) = err.container() {
                if let Err(e) = container.terminate().await {
                    warn!(container_id = container.id(), error = %e, "cleanup after failed start");
                }
            }
            provider.shutdown().await;
            return Err(err).with_context(|| format!("running {}", cmd.image));
        }
    };

    let endpoints = match collect_endpoints(&container).await {
        Ok(endpoints) => endpoints,
        Err(e) => {
            warn!(error = %e, "could not resolve endpoints");
            BTreeMap::new()
        }
    };

    if ctx.common.json {
        let report = serde_json::json!({
            "id": container.id(),
            "session": provider.session().to_string(),
            "endpoints": endpoints,
        });
        println!("{}", serde_json::to_string_pretty(&report).context("serializing report")?);
    } else {
        println!("{}", container.id());
        for (port, endpoint) in &endpoints {
            println!("  {port} -> {endpoint}");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!(container_id = container.id(), "interrupted, terminating container");

    let terminated = container.terminate().await;
    provider.shutdown().await;
    terminated.with_context(|| format!("terminating container {}", container.id()))
}

/// Host endpoints of every exposed port that has a binding.
async fn collect_endpoints(
    container: &dyn Container,
) -> Result<BTreeMap<String, String>, ContainerError> {
    let mut endpoints = BTreeMap::new();
    for port in container.get_ports().await? {
        let spec = port.to_string();
        match container.get_host_endpoint(&spec).await {
            Ok(endpoint) => {
                endpoints.insert(spec, endpoint);
            }
            Err(ContainerError::PortNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(endpoints)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.settings)
                        .context("serializing config to JSON")?
                );
            } else {
                print!(
                    "{}",
                    ctx.settings.to_toml().context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            let path = ctx
                .common
                .config
                .clone()
                .or_else(settings::default_config_path)
                .ok_or_else(|| anyhow!("could not determine config directory"))?;
            println!("{}", path.display());
            Ok(())
        }
    }
}
