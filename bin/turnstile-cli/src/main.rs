//! Turnstile operator CLI
//!
//! Validates configuration, decodes cluster node entries and runs an
//! interactive login against the configured chains.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnstile_auth::identity::password_digest;
use turnstile_auth::{
    AttemptStatus, AuthEngine, Callback, MemoryIdentityStore, ModuleRegistry, NodeAffinityEntry,
    modules,
};
use turnstile_common::Config;

#[derive(Parser, Debug)]
#[command(name = "turnstile")]
#[command(about = "Turnstile authentication engine CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "TURNSTILE_CONFIG", default_value = "/etc/turnstile/turnstile.toml")]
    config: String,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the configuration and check every chain binds to a module
    CheckConfig,
    /// Decode a `url|id` cluster node entry
    ParseNode {
        /// Encoded entry
        encoded: String,
    },
    /// Print the password digest used for seeded identities
    HashPassword {
        password: String,
    },
    /// Run an interactive login
    Login {
        /// Chain name (defaults to the configured default chain)
        #[arg(long)]
        chain: Option<String>,
        /// Identity asserted up front
        #[arg(short, long)]
        user: Option<String>,
    },
}

fn build_engine(config: &Config) -> Result<AuthEngine> {
    let store = Arc::new(MemoryIdentityStore::from_seed(&config.users));
    let mut builder = ModuleRegistry::builder();
    modules::register_builtin(&mut builder, store.clone());
    builder
        .bind_all(&config.modules)
        .context("failed to bind authentication modules")?;
    let engine = AuthEngine::new(config, builder.build(), store)
        .context("failed to initialize authentication engine")?;
    Ok(engine)
}

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, text: &str) -> Result<String> {
    println!("{text}");
    match lines.next_line().await? {
        Some(line) => Ok(line.trim_end().to_string()),
        None => bail!("input closed"),
    }
}

async fn answer(lines: &mut Lines<BufReader<Stdin>>, callback: &Callback) -> Result<Callback> {
    let answered = match callback {
        Callback::TextPrompt { prompt: text, .. } | Callback::SecretPrompt { prompt: text, .. } => {
            let value = prompt(lines, &format!("{text}:")).await?;
            callback.clone().answer(value)
        }
        Callback::Choice {
            prompt: text,
            choices: options,
            ..
        }
        | Callback::Confirmation {
            prompt: text,
            options,
            ..
        } => {
            for (i, option) in options.iter().enumerate() {
                println!("  [{i}] {option}");
            }
            let choice = prompt(lines, &format!("{text}:")).await?;
            let index: usize = choice
                .trim()
                .parse()
                .with_context(|| format!("not an option number: {choice}"))?;
            callback.clone().select(index)
        }
        Callback::HiddenValue { value, .. } => {
            callback.clone().answer(value.clone().unwrap_or_default())
        }
    };
    Ok(answered)
}

async fn login(engine: &AuthEngine, chain: Option<&str>, user: Option<&str>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut response = engine.start_attempt(chain, user).await?;
    info!(attempt = %response.attempt_id, "login started");

    loop {
        match &response.status {
            AttemptStatus::Challenge(callbacks) => {
                let mut answers = Vec::with_capacity(callbacks.len());
                for callback in callbacks {
                    answers.push(answer(&mut lines, callback).await?);
                }
                response = engine
                    .continue_attempt(&response.attempt_id, response.round, answers)
                    .await?;
            }
            AttemptStatus::Success(session) => {
                println!("Login succeeded");
                println!("  Identity: {}", session.identity.as_deref().unwrap_or("-"));
                println!("  Chain:    {}", session.chain);
                println!(
                    "  State:    {}",
                    serde_json::to_string(&session.shared_state)?
                );
                return Ok(());
            }
            AttemptStatus::Failure => {
                println!("Login failed");
                return Ok(());
            }
            AttemptStatus::Aborted => {
                println!("Login aborted");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    let json = matches!(args.log_format, LogFormat::Json);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    match args.command {
        Commands::ParseNode { encoded } => {
            let entry: NodeAffinityEntry = encoded.parse()?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Commands::HashPassword { password } => {
            println!("{}", password_digest(&password));
        }
        Commands::CheckConfig => {
            let config = Config::load(&args.config)
                .with_context(|| format!("failed to load {}", args.config))?;
            let engine = build_engine(&config)?;
            println!("Configuration OK");
            println!("  Chains:  {}", engine.chains().names().join(", "));
            println!("  Modules: {}", config.modules.len());
            println!("  Nodes:   {}", engine.nodes().len());
        }
        Commands::Login { chain, user } => {
            let config = Config::load(&args.config)
                .with_context(|| format!("failed to load {}", args.config))?;
            let engine = build_engine(&config)?;
            login(&engine, chain.as_deref(), user.as_deref()).await?;
        }
    }

    Ok(())
}
