use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use lightpost_sim::config::AppConfig;
use lightpost_sim::driver::{self, Target};
use lightpost_sim::mqtt::mqtt_handler::MqttHandler;
use lightpost_sim::provisioning;
use lightpost_sim::service::Gateway;
use lightpost_sim::store::{DeviceStore, JsonFilePersistence, MemoryPersistence, RecordPersistence};
use lightpost_sim::topic::{classify, MessageKind, Scope, TopicScheme};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "lightpost-sim", version, about = "Lightpost fleet simulator")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the broker and serve config/request traffic
    Run {
        /// Start timed publishing immediately, regardless of the config file
        #[arg(long)]
        timed: bool,
    },
    /// Generate a tag list from a base identifier and a hex range
    Tags {
        #[arg(long)]
        base: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long, default_value = "generated_topics.txt")]
        out: PathBuf,
    },
    /// Show how a topic is routed
    Classify { topic: String },
    /// Publish config or request payloads toward a gateway
    Publish(PublishArgs),
    /// Write a configuration file with every default filled in
    InitConfig {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct PublishArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// `config` or `request`
    #[arg(long, default_value = "config")]
    kind: MessageKind,

    #[command(flatten)]
    payload: PayloadArgs,

    /// Follow every config with a null-free copy on the target's response topic
    #[arg(long)]
    echo_response: bool,

    /// Pause between payload rounds
    #[arg(long, default_value_t = 1000)]
    pace_ms: u64,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// The core device
    #[arg(long)]
    core: bool,
    /// One lightpost tag
    #[arg(long)]
    tag: Option<String>,
    /// Inclusive tag range, FROM-TO
    #[arg(long)]
    range: Option<String>,
    /// Every known tag
    #[arg(long)]
    all: bool,
}

impl TargetArgs {
    fn target(&self) -> Result<Target, driver::DriverError> {
        if let Some(tag) = &self.tag {
            Ok(Target::Tag(tag.clone()))
        } else if let Some(range) = &self.range {
            Target::range(range)
        } else if self.all {
            Ok(Target::All)
        } else {
            Ok(Target::Core)
        }
    }
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct PayloadArgs {
    /// Inline JSON payload
    #[arg(long)]
    payload: Option<String>,
    /// File shaped {"payloads": [...]}
    #[arg(long)]
    payloads: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);

    match cli.command {
        Command::Run { timed } => {
            let config = AppConfig::load(&config_path).await?;
            setup_logging(&config.log_level);
            run(config, timed).await
        }
        Command::Tags {
            base,
            start,
            end,
            out,
        } => {
            setup_logging("info");
            let tags = provisioning::generate_tags(&base, &start, &end)?;
            provisioning::write_tag_file(&out, &tags)?;
            println!("Generated {} tags. Saved to {}", tags.len(), out.display());
            Ok(())
        }
        Command::Classify { topic } => {
            let descriptor = classify(&topic)?;
            println!("{}", descriptor);
            Ok(())
        }
        Command::Publish(args) => {
            let config = AppConfig::load(&config_path).await?;
            setup_logging(&config.log_level);
            publish(config, args).await
        }
        Command::InitConfig { out } => {
            setup_logging("info");
            let path = out.unwrap_or(config_path);
            AppConfig::default().save(&path).await
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// `RUST_LOG` wins over the configured level when it holds a plain level name.
fn setup_logging(configured: &str) {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|env| Level::from_str(&env).ok())
        .or_else(|| Level::from_str(configured).ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn run(config: AppConfig, force_timed: bool) -> Result<()> {
    let tags = config.provisioning.resolve_tags()?;
    info!("Known lightpost tags: {}", tags.len());

    let persistence: Arc<dyn RecordPersistence> = match &config.gateway.data_dir {
        Some(dir) => Arc::new(JsonFilePersistence::open(dir).await?),
        None => {
            warn!("No data_dir configured, device records are kept in memory only");
            Arc::new(MemoryPersistence::new())
        }
    };
    let store = Arc::new(DeviceStore::new(persistence, config.gateway.merge_policy()));
    store
        .preload(std::iter::once(Scope::Core).chain(tags.iter().map(Scope::device)))
        .await;

    let topics = TopicScheme::new(config.gateway.base_topic.clone());
    let capacity = config.mqtt.channel_capacity.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let publisher_settings = config
        .timed_publishing
        .settings()
        .map_err(|e| eyre!("Invalid timed publishing target: {}", e))?;
    let gateway = Gateway::new(store, topics.clone(), outbound_tx, publisher_settings)?;

    let shutdown = CancellationToken::new();
    let mqtt = MqttHandler::new(&config.mqtt, topics.inbound_filters());
    let mqtt_shutdown = shutdown.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt.run(inbound_tx, outbound_rx, mqtt_shutdown).await {
            error!("MQTT bridge stopped: {}", e);
        }
    });

    let dispatch_handle = gateway.spawn_dispatch(inbound_rx, shutdown.clone());

    if config.gateway.announce_on_start {
        gateway.announce().await;
    }
    if config.timed_publishing.enabled || force_timed {
        gateway.publisher().start().await?;
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;
    info!("Shutdown requested");

    if let Some(published) = gateway.publisher().stop().await {
        info!("Timed publishing sent {} snapshots", published);
    }
    shutdown.cancel();
    let _ = dispatch_handle.await;
    let _ = mqtt_handle.await;

    let stats = gateway.diagnostics().snapshot();
    info!(
        "Stopped: {} handled, {} dropped, {} lookup misses, {} store failures",
        stats.handled, stats.dropped, stats.lookup_misses, stats.store_failures
    );
    Ok(())
}

async fn publish(config: AppConfig, args: PublishArgs) -> Result<()> {
    let tags = config.provisioning.resolve_tags()?;
    let targets = args.target.target()?.resolve(&tags)?;

    let payloads = match (&args.payload.payload, &args.payload.payloads) {
        (Some(raw), _) => vec![driver::parse_payload(args.kind, raw)?],
        (None, Some(path)) => driver::load_payload_file(path, args.kind).await?,
        (None, None) => return Err(eyre!("Either --payload or --payloads is required")),
    };

    let topics = TopicScheme::new(config.gateway.base_topic.clone());
    let rounds = driver::plan(&topics, &targets, args.kind, &payloads, args.echo_response);
    info!(
        "Publishing {} payloads of kind {} to {} targets",
        payloads.len(),
        args.kind,
        targets.len()
    );

    let sent = driver::publish_rounds(&config.mqtt, rounds, Duration::from_millis(args.pace_ms)).await?;
    println!("Published {} messages", sent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_args(args: &[&str]) -> Result<PublishArgs, clap::Error> {
        let argv = ["lightpost-sim", "publish"].iter().chain(args.iter());
        match Cli::try_parse_from(argv)?.command {
            Command::Publish(args) => Ok(args),
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn publish_takes_exactly_one_target_and_one_payload_source() {
        let args = publish_args(&["--range", "TAG1-TAG3", "--payload", "{}"]).unwrap();
        assert_eq!(
            args.target.target().unwrap(),
            Target::Range {
                from: "TAG1".to_string(),
                to: "TAG3".to_string()
            }
        );
        assert_eq!(args.kind, MessageKind::Config);
        assert_eq!(args.pace_ms, 1000);

        let args = publish_args(&["--core", "--kind", "request", "--payloads", "p.json"]).unwrap();
        assert_eq!(args.target.target().unwrap(), Target::Core);
        assert_eq!(args.kind, MessageKind::Request);
        assert_eq!(args.payload.payloads, Some(PathBuf::from("p.json")));

        assert!(publish_args(&["--payload", "{}"]).is_err());
        assert!(publish_args(&["--core", "--tag", "A", "--payload", "{}"]).is_err());
        assert!(publish_args(&["--tag", "A"]).is_err());
        assert!(publish_args(&["--tag", "A", "--payload", "{}", "--payloads", "p.json"]).is_err());
        assert!(publish_args(&["--tag", "A", "--kind", "bogus", "--payload", "{}"]).is_err());
    }
}
