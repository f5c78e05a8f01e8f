use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::clock::system_clock;
use tollgate::config::{LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{
    Actor, AtomicMetrics, Caller, FixedWindowCounter, LimitResolver, LocalLimiter, Origin,
    RateLimitDecision, RateLimiter, Scope, StaticLimitSource, SubscriptionLimiter,
};

/// Exit code for a denied request.
const EXIT_DENIED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Per-actor request quota enforcement")]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Rate limit rules file, overriding `rate_limiting.rules_path`
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count requests for a caller and print each decision
    Acquire {
        /// Quota scope, e.g. `completion`
        #[arg(long)]
        scope: String,

        #[command(flatten)]
        caller: CallerArgs,

        /// Number of requests to count
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Print the usage counted for a caller in the current window
    Inspect {
        #[arg(long)]
        scope: String,

        #[command(flatten)]
        caller: CallerArgs,
    },
}

#[derive(Debug, Args)]
struct CallerArgs {
    /// Access token of an externally-billed caller
    #[arg(long, conflicts_with_all = ["user", "ip", "forwarded_for", "internal"])]
    token: Option<String>,

    /// Authenticated user id
    #[arg(long, conflicts_with_all = ["ip", "forwarded_for", "internal"])]
    user: Option<i64>,

    /// Peer address of an anonymous caller
    #[arg(long)]
    ip: Option<String>,

    /// Client address forwarded by the trusted proxy
    #[arg(long)]
    forwarded_for: Option<String>,

    /// Trusted internal caller
    #[arg(long, conflicts_with_all = ["ip", "forwarded_for"])]
    internal: bool,
}

impl CallerArgs {
    fn caller(&self) -> Caller {
        if let Some(token) = &self.token {
            return Caller::AccessToken(token.clone());
        }
        if self.internal {
            return Caller::Actor(Actor::Internal);
        }
        if let Some(id) = self.user {
            return Caller::Actor(Actor::user(id));
        }
        Caller::Actor(Actor::anonymous(Origin {
            peer_addr: self.ip.clone(),
            forwarded_for: self.forwarded_for.clone(),
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = TollgateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    debug!(version = env!("CARGO_PKG_VERSION"), "Starting Tollgate");

    let (scope, caller) = match &cli.command {
        Command::Acquire { scope, caller, .. } | Command::Inspect { scope, caller } => {
            (scope.parse::<Scope>()?, caller.caller())
        }
    };

    let clock = system_clock();
    let store = config.store.connect(clock.clone()).await?;
    let metrics = Arc::new(AtomicMetrics::new());
    let counter = FixedWindowCounter::new(store.clone(), clock, metrics.clone());

    let limiter: RateLimiter = match &caller {
        Caller::AccessToken(_) => SubscriptionLimiter::new(
            config.entitlements.build_source()?,
            config.entitlements.build_cache(store),
            counter,
            config.entitlements.settings(),
        )
        .into(),
        Caller::Actor(_) => {
            let rules_path = cli
                .rules
                .clone()
                .or_else(|| config.rate_limiting.rules_path.as_ref().map(PathBuf::from));
            let source = match rules_path {
                Some(path) => StaticLimitSource::from_file(path)?,
                None => {
                    info!("No rate limit rules configured, every scope is unlimited");
                    StaticLimitSource::default()
                }
            };
            LocalLimiter::new(LimitResolver::new(Arc::new(source)), counter).into()
        }
    };

    match cli.command {
        Command::Acquire { times, .. } => {
            let mut denied = false;
            for _ in 0..times {
                let decision = limiter.try_acquire(&caller, scope).await?;
                denied = matches!(decision, RateLimitDecision::Deny(_));
                println!("{}", serde_json::to_string(&decision)?);
            }

            debug!(metrics = ?metrics.snapshot(), "Finished");
            if denied {
                return Ok(ExitCode::from(EXIT_DENIED));
            }
        }
        Command::Inspect { .. } => {
            if !config.store.is_shared() {
                warn!(
                    "The memory store only holds counts from this invocation; \
                     set store.backend to redis to inspect shared usage"
                );
            }
            let used = limiter.usage(&caller, scope).await?;
            println!("{}", json!({ "scope": scope, "used": used }));
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Initialize tracing on stderr, leaving stdout to command output.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}
