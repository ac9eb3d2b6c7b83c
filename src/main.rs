use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scw_provider::config::ProviderConfig;
use scw_provider::provider::data::{AttributeBag, ResourceData};
use scw_provider::provider::descriptor::{
    DescriptorRegistry, PlanAction, ResourceDescriptor,
};
use scw_provider::provider::diag::Diagnostics;
use scw_provider::provider::meta::Context;
use scw_provider::Provider;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Drive Scaleway resources through their lifecycle from the command line
#[derive(Parser, Debug)]
#[command(name = "scw-provider", version = scw_provider::VERSION, about, long_about = None)]
struct Args {
    /// Provider block (YAML or JSON); the environment and the scw profile fill the rest
    #[arg(short = 'c', long, global = true)]
    provider_config: Option<PathBuf>,

    /// Profile of ~/.config/scw/config.yaml to use
    #[arg(short, long, global = true)]
    profile: Option<String>,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered kinds, or print the schema of one
    Schema {
        kind: Option<String>,
        /// Look the kind up among data sources
        #[arg(long)]
        data: bool,
    },
    /// Plan a change of one resource
    Plan {
        kind: String,
        /// Desired attributes (JSON)
        #[arg(long)]
        config: PathBuf,
        /// Current state file, absent for a new resource
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Create a resource and write its state
    Create {
        kind: String,
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        state: PathBuf,
    },
    /// Refresh a state file from the remote object
    Read {
        #[arg(long)]
        state: PathBuf,
    },
    /// Apply a changed configuration to an existing resource
    Update {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        state: PathBuf,
    },
    /// Delete the resource of a state file
    Delete {
        #[arg(long)]
        state: PathBuf,
    },
    /// Adopt an existing remote object into a new state file
    Import {
        kind: String,
        id: String,
        #[arg(long)]
        state: PathBuf,
    },
    /// Read a data source and print its attributes
    Data {
        kind: String,
        #[arg(long)]
        config: PathBuf,
    },
    /// Upgrade a state file written under an older schema version
    UpgradeState {
        #[arg(long)]
        state: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("cannot open log file {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("scw-provider {} started with log level: {:?}", scw_provider::VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("scw-provider").join("scw-provider.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".scw-provider").join("scw-provider.log");
    }
    PathBuf::from("scw-provider.log")
}

/// One resource as persisted between invocations
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    schema_version: u64,
    id: Option<String>,
    #[serde(default)]
    attributes: Map<String, Value>,
}

impl StateFile {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read state file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("cannot parse state file {}", path.display()))
    }

    fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("cannot write state file {}", path.display()))
    }

    fn id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .with_context(|| format!("state of {} has no ID", self.kind))
    }
}

fn load_object(path: &Path) -> Result<Map<String, Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("cannot parse {}", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("{} must hold a JSON object", path.display()),
    }
}

fn resource<'a>(provider: &'a Provider, kind: &str) -> Result<&'a ResourceDescriptor> {
    provider
        .resource(kind)
        .with_context(|| format!("unknown resource kind {:?}", kind))
}

/// Print diagnostics on stderr; errors fail the command
fn report(diags: &Diagnostics) -> Result<()> {
    if !diags.is_empty() {
        eprintln!("{}", serde_json::to_string_pretty(diags)?);
    }
    if diags.has_errors() {
        bail!("{} error(s)", diags.errors().count());
    }
    Ok(())
}

fn state_of(kind: &str, descriptor: &ResourceDescriptor, data: &ResourceData) -> StateFile {
    StateFile {
        kind: kind.to_string(),
        schema_version: descriptor.schema.version,
        id: data.id().map(String::from),
        attributes: data.attributes().clone(),
    }
}

fn build_provider(args: &Args) -> Result<Provider> {
    let mut block = match &args.provider_config {
        Some(path) => ProviderConfig::load(path)?,
        None => ProviderConfig::default(),
    };
    if args.profile.is_some() {
        block.profile = args.profile.clone();
    }
    let meta = block.resolve()?.into_meta()?;
    Ok(Provider::new(meta))
}

async fn run(args: Args, ctx: Context) -> Result<()> {
    let provider = build_provider(&args)?;
    let meta = provider.meta();

    match args.command {
        Command::Schema { kind: None, .. } => {
            let listing = json!({
                "resources": provider.resource_names(),
                "data_sources": provider.data_source_names(),
            });
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Command::Schema { kind: Some(kind), data } => {
            let schema = if data {
                &provider
                    .data_source(&kind)
                    .with_context(|| format!("unknown data source {:?}", kind))?
                    .schema
            } else {
                &resource(&provider, &kind)?.schema
            };
            println!("{}", serde_json::to_string_pretty(&schema.to_json())?);
        }
        Command::Plan { kind, config, state } => {
            let descriptor = resource(&provider, &kind)?;
            let prior = state.as_deref().map(StateFile::load).transpose()?;
            let prior = prior.map(|s| {
                let mut attributes = s.attributes;
                if let Some(id) = s.id {
                    attributes.insert("id".to_string(), json!(id));
                }
                attributes
            });
            match descriptor.plan(prior.as_ref(), load_object(&config)?, meta) {
                Ok(plan) => println!("{}", serde_json::to_string_pretty(&plan)?),
                Err(diags) => report(&diags)?,
            }
        }
        Command::Create { kind, config, state } => {
            let descriptor = resource(&provider, &kind)?;
            let plan = match descriptor.plan(None, load_object(&config)?, meta) {
                Ok(plan) => plan,
                Err(diags) => return report(&diags),
            };
            let mut data = ResourceData::new(plan.planned);
            let diags = descriptor.create(&ctx, &mut data, meta).await;
            if data.id().is_some() {
                state_of(&kind, descriptor, &data).save(&state)?;
            }
            report(&diags)?;
        }
        Command::Read { state } => {
            let stored = StateFile::load(&state)?;
            let descriptor = resource(&provider, &stored.kind)?;
            let mut data = ResourceData::from_state(stored.id()?, stored.attributes.clone());
            let diags = descriptor.read(&ctx, &mut data, meta).await;
            report(&diags)?;
            if data.id().is_none() {
                eprintln!("{} {} no longer exists", stored.kind, stored.id()?);
                std::fs::remove_file(&state)?;
            } else {
                state_of(&stored.kind, descriptor, &data).save(&state)?;
            }
        }
        Command::Update { config, state } => {
            let stored = StateFile::load(&state)?;
            let descriptor = resource(&provider, &stored.kind)?;
            let id = stored.id()?.to_string();
            let mut prior = stored.attributes.clone();
            prior.insert("id".to_string(), json!(id));
            let plan = match descriptor.plan(Some(&prior), load_object(&config)?, meta) {
                Ok(plan) => plan,
                Err(diags) => return report(&diags),
            };
            match plan.action {
                PlanAction::NoOp => {
                    eprintln!("no changes");
                    return Ok(());
                }
                PlanAction::Replace => bail!(
                    "changing {} requires replacing the resource",
                    plan.requires_replace.join(", ")
                ),
                PlanAction::Create | PlanAction::Update => {}
            }
            let mut data = ResourceData::planned(id, stored.attributes, plan.planned);
            let diags = descriptor.update(&ctx, &mut data, meta).await;
            state_of(&stored.kind, descriptor, &data).save(&state)?;
            report(&diags)?;
        }
        Command::Delete { state } => {
            let stored = StateFile::load(&state)?;
            let descriptor = resource(&provider, &stored.kind)?;
            let mut data = ResourceData::from_state(stored.id()?, stored.attributes.clone());
            let diags = descriptor.delete(&ctx, &mut data, meta).await;
            report(&diags)?;
            std::fs::remove_file(&state)?;
        }
        Command::Import { kind, id, state } => {
            let descriptor = resource(&provider, &kind)?;
            let mut data = ResourceData::default();
            let diags = descriptor.import(&ctx, &id, &mut data, meta).await;
            report(&diags)?;
            state_of(&kind, descriptor, &data).save(&state)?;
        }
        Command::Data { kind, config } => {
            let descriptor = provider
                .data_source(&kind)
                .with_context(|| format!("unknown data source {:?}", kind))?;
            let mut data = ResourceData::new(load_object(&config)?);
            let diags = descriptor.read(&ctx, &mut data, meta).await;
            report(&diags)?;
            println!("{}", serde_json::to_string_pretty(data.attributes())?);
        }
        Command::UpgradeState { state } => {
            let mut stored = StateFile::load(&state)?;
            let descriptor = resource(&provider, &stored.kind)?;
            let mut attributes = std::mem::take(&mut stored.attributes);
            if let Some(id) = &stored.id {
                attributes.insert("id".to_string(), json!(id));
            }
            let mut upgraded = descriptor
                .upgrade_state(stored.schema_version, attributes, meta)
                .with_context(|| format!("cannot upgrade {}", state.display()))?;
            stored.id = upgraded
                .remove("id")
                .and_then(|v| v.as_str().map(String::from))
                .or(stored.id);
            stored.attributes = upgraded;
            stored.schema_version = descriptor.schema.version;
            stored.save(&state)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling in-flight calls");
            on_signal.cancel();
        }
    });

    run(args, Context::new(cancel)).await
}
