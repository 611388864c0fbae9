use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "compote")]
#[command(about = "Run compose manifests on the container runtime", version)]
struct Cli {
    /// Path to the compose file
    #[arg(short = 'f', long = "file", global = true, default_value = "compose.yaml")]
    file: String,

    /// Project name (defaults to the compose file's directory name)
    #[arg(short = 'p', long = "project", global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start services
    Up {
        /// Detach: return once services are up instead of waiting for exits
        #[arg(short, long)]
        detach: bool,

        /// Services to bring up (default: all)
        services: Vec<String>,
    },

    /// Stop and remove containers, port forwards, and networks
    Down {
        /// Also remove project-scoped volumes
        #[arg(long)]
        volumes: bool,
    },

    /// Start known, stopped services or replicas (service[#replica])
    Start {
        selectors: Vec<String>,
    },

    /// Stop running services or replicas
    Stop {
        /// Grace period in seconds before the runtime force-kills
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,

        selectors: Vec<String>,
    },

    /// Restart services or replicas
    Restart {
        /// Grace period in seconds before the runtime force-kills
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,

        selectors: Vec<String>,
    },

    /// Scale services to exact replica counts (service=replicas)
    Scale {
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Pull service images
    Pull {
        services: Vec<String>,
    },

    /// Push service images
    Push {
        services: Vec<String>,
    },

    /// Run a command in a running replica
    Exec {
        /// Environment variables (KEY=VALUE)
        #[arg(short, long)]
        env: Vec<String>,

        /// Target service or replica (service[#replica])
        selector: String,

        /// Command to run
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Stream service logs
    Logs {
        /// Last N lines per source
        #[arg(long)]
        tail: Option<usize>,

        /// Keep streaming after the current buffer
        #[arg(short = 'F', long)]
        follow: bool,

        /// Drop stderr lines
        #[arg(long)]
        no_stderr: bool,

        selectors: Vec<String>,
    },

    /// Show service status
    Ps,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let project = commands::ProjectContext::resolve(&cli.file, cli.project.clone())?;

    match cli.command {
        Commands::Up { detach, services } => commands::up::run(&project, services, detach).await,
        Commands::Down { volumes } => commands::down::run(&project, volumes).await,
        Commands::Start { selectors } => commands::lifecycle::start(&project, selectors).await,
        Commands::Stop { timeout, selectors } => {
            commands::lifecycle::stop(&project, selectors, timeout).await
        }
        Commands::Restart { timeout, selectors } => {
            commands::lifecycle::restart(&project, selectors, timeout).await
        }
        Commands::Scale { targets } => commands::lifecycle::scale(&project, targets).await,
        Commands::Pull { services } => commands::images::pull(&project, services).await,
        Commands::Push { services } => commands::images::push(&project, services).await,
        Commands::Exec { env, selector, command } => {
            commands::exec::run(&project, selector, command, env).await
        }
        Commands::Logs { tail, follow, no_stderr, selectors } => {
            commands::logs::run(&project, selectors, tail, follow, !no_stderr).await
        }
        Commands::Ps => commands::ps::run(&project).await,
    }
}
