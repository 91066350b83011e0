//! LiveProto CLI -- session inspection and TL payload decoding.
//!
//! Usage:
//!   liveproto show                         # Load (or create) the configured session
//!   liveproto --name bot --mode file show  # Override session name and backend
//!   liveproto export                       # Print a portable session string
//!   liveproto msg-id --count 3             # Issue message ids and persist
//!   liveproto decode --schema api.tl HEX   # Decode a hex payload

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use liveproto_session::config::expand_tilde;
use liveproto_session::{SessionManager, SessionSettings};
use liveproto_tl::{Binary, Schema};

#[derive(Parser)]
#[command(name = "liveproto", about = "LiveProto session and TL tools")]
struct Cli {
    /// Path to settings file
    #[arg(short, long, default_value = "~/.liveproto/session.toml")]
    config: String,

    /// Session name (overrides the settings file)
    #[arg(long)]
    name: Option<String>,

    /// Storage mode: string, file, sqlite, mysql, text
    #[arg(long)]
    mode: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the session's datacenter, identity and counters
    Show,
    /// Print the session as an inline string for `--mode text`
    Export,
    /// Issue new message ids and save the session
    MsgId {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Decode a hex-encoded TL payload against a schema file
    Decode {
        /// TL schema (`name#id params = Type;` lines)
        #[arg(long)]
        schema: PathBuf,
        /// Payload bytes as hex
        payload: String,
    },
    /// Summarise a TL schema file
    Schema {
        path: PathBuf,
    },
}

/// Every workspace crate logs at info unless `RUST_LOG` says otherwise.
const DEFAULT_LOG_FILTER: &str =
    "liveproto=info,liveproto_session=info,liveproto_storage=info,liveproto_tl=info";

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match &cli.command {
        Commands::Show => {
            let manager = open_session(&cli)?;
            let content = manager
                .content()
                .context("session did not load")?;
            let summary = serde_json::json!({
                "backend": manager.backend().unwrap_or("memory"),
                "state": format!("{:?}", manager.state()),
                "id": content.id,
                "dc": content.dc,
                "ip": content.ip,
                "port": content.port,
                "ipv6": content.ipv6,
                "test_mode": content.test_mode,
                "api_id": content.api_id,
                "authorized": !content.auth_key.is_empty(),
                "step": content.step.as_str(),
                "salt": content.salt,
                "sequence": content.sequence,
                "time_offset": content.time_offset,
                "last_msg_id": content.last_msg_id,
                "logout_tokens": content.logout_tokens.len(),
                "cached_peers": content.peers.len(),
                "state_counters": {
                    "pts": content.state.pts,
                    "qts": content.state.qts,
                    "date": content.state.date,
                    "seq": content.state.seq,
                },
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Export => {
            let manager = open_session(&cli)?;
            println!("{}", manager.export_string()?);
        }
        Commands::MsgId { count } => {
            let mut manager = open_session(&cli)?;
            for _ in 0..*count {
                println!("{}", manager.new_msg_id()?);
            }
            let report = manager.save()?;
            if !report.is_complete() {
                eprintln!("Warning: failed to save fields: {}", report.failed.join(", "));
            }
        }
        Commands::Decode { schema, payload } => {
            let text = std::fs::read_to_string(schema)
                .with_context(|| format!("reading schema {}", schema.display()))?;
            let registry = Schema::parse(&text)?.to_registry();
            let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = hex::decode(cleaned.trim_start_matches("0x")).context("payload is not hex")?;

            let mut binary = Binary::from_bytes(&bytes);
            while !binary.is_empty() {
                let name = binary.describe(&registry);
                let value = binary
                    .read_object(&registry)
                    .with_context(|| format!("decoding {name} at offset {}", binary.position()))?;
                println!("{name}: {value:#?}");
            }
        }
        Commands::Schema { path } => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading schema {}", path.display()))?;
            let schema = Schema::parse(&text)?;
            match schema.layer {
                Some(layer) => println!("Layer: {layer}"),
                None => println!("Layer: unknown"),
            }
            println!("Constructors: {}", schema.constructors.len());
            println!("Functions: {}", schema.functions.len());
        }
    }

    Ok(())
}

fn open_session(cli: &Cli) -> anyhow::Result<SessionManager> {
    let config_path = expand_tilde(&cli.config);
    let mut settings = SessionSettings::load_or_default(&config_path)?;
    if let Some(name) = &cli.name {
        settings.session.name = Some(name.clone());
    }
    if let Some(mode) = &cli.mode {
        settings.session.mode = mode.clone();
    }
    let mut manager = SessionManager::new(settings);
    manager.load()?;
    Ok(manager)
}
