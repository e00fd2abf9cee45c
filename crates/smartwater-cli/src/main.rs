use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use smartwater_core::config::{DEFAULT_BACKEND_URL, DEFAULT_THINGSPEAK_URL};
use smartwater_core::{
    latest_metrics, Banner, ConfigStore, Credentials, DeviceConfig, DeviceConfigPatch, Endpoints,
    FeedTransport, FieldKind, Gateway, HttpTransport, NormalizedSample, PollSnapshot, Poller,
    PollerConfig, ReadingsOutcome, UserStore, FIELD_TABLE,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod server;
mod viewer;
#[cfg(test)]
mod server_tests;

const SETTINGS_RELOAD: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "smartwaterd")]
#[command(about = "Smart water tank telemetry poller and credential-hiding proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value = "./smartwater.json")]
    config_file: PathBuf,

    #[arg(long, default_value_t = 15000)]
    interval_ms: u64,

    #[arg(long, default_value_t = 50)]
    results: u32,

    #[arg(long, default_value_t = 10000)]
    timeout_ms: u64,

    #[arg(long, default_value = DEFAULT_THINGSPEAK_URL)]
    thingspeak_url: String,

    #[arg(long, default_value = DEFAULT_BACKEND_URL)]
    backend_url: String,

    /// Read through the backend proxy with this bearer token instead of the local settings.
    #[arg(long, env = "SMARTWATER_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Configure {
        #[arg(long)]
        channel_id: Option<String>,
        #[arg(long)]
        read_key: Option<String>,
        #[arg(long)]
        write_key: Option<String>,
        #[arg(long)]
        wifi_ssid: Option<String>,
        #[arg(long)]
        wifi_pass: Option<String>,
    },
    ShowConfig,
    Once {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    Run {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Watch {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    View,
    Serve {
        #[arg(long, default_value = "0.0.0.0:5000")]
        bind: String,
        #[arg(long, default_value = "./data/users.json")]
        users_file: PathBuf,
    },
    IssueToken {
        #[arg(long)]
        username: String,
        #[arg(long, default_value = "./data/users.json")]
        users_file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

/// Where each poll tick gets its credentials from.
#[derive(Debug, Clone)]
enum CredentialSource {
    Token(String),
    Settings(ConfigStore),
}

impl CredentialSource {
    fn load(&self) -> Result<Credentials> {
        Ok(match self {
            Self::Token(token) => Credentials::Session {
                token: token.clone(),
            },
            Self::Settings(store) => Credentials::Channel(store.load()?.channel()),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let poller_config = PollerConfig {
        interval: Duration::from_millis(cli.interval_ms),
        window_size: cli.results,
        request_timeout: Duration::from_millis(cli.timeout_ms),
    };
    let endpoints = Endpoints {
        thingspeak_url: cli.thingspeak_url.clone(),
        backend_url: cli.backend_url.clone(),
    };
    let settings = ConfigStore::new(cli.config_file.clone());
    let source = match cli.token.clone().filter(|t| !t.trim().is_empty()) {
        Some(token) => CredentialSource::Token(token),
        None => CredentialSource::Settings(settings.clone()),
    };

    match cli.command {
        Command::Configure {
            channel_id,
            read_key,
            write_key,
            wifi_ssid,
            wifi_pass,
        } => {
            let saved = settings.patch(DeviceConfigPatch {
                channel_id,
                read_key,
                write_key,
                wifi_ssid,
                wifi_pass,
            })?;
            info!(
                path = %settings.path().display(),
                channel_id = %saved.channel_id,
                "settings saved"
            );
            println!("{}", serde_json::to_string_pretty(&masked(&saved))?);
        }
        Command::ShowConfig => {
            let config = settings.load()?;
            println!("{}", serde_json::to_string_pretty(&masked(&config))?);
        }
        Command::Once { format } => {
            let poller = new_poller(&endpoints, &poller_config)?;
            let outcome = poller.fetch_once(&source.load()?).await;
            print_outcome(&outcome, format)?;
        }
        Command::Run { format } | Command::Watch { format } => {
            let mut poller = new_poller(&endpoints, &poller_config)?;
            stream_loop(&mut poller, &source, poller_config.interval, format).await?;
        }
        Command::View => {
            let mut poller = new_poller(&endpoints, &poller_config)?;
            let (config_tx, config_rx) = watch::channel(source.load()?);
            let reload = spawn_settings_reload(source, config_tx);
            let result = viewer::run_viewer(&mut poller, config_rx, poller_config.interval).await;
            reload.abort();
            result?;
        }
        Command::Serve { bind, users_file } => {
            let state = server::ApiState {
                users: Arc::new(UserStore::open(users_file)?),
                upstream: Arc::new(HttpTransport::new(endpoints, poller_config.request_timeout)?),
                window_size: poller_config.window_size,
            };
            server::serve(&bind, state).await?;
        }
        Command::IssueToken {
            username,
            users_file,
        } => {
            let users = UserStore::open(users_file)?;
            let token = users.issue_token(&username).await?;
            println!("{token}");
        }
    }

    Ok(())
}

fn new_poller(endpoints: &Endpoints, config: &PollerConfig) -> Result<Poller<HttpTransport>> {
    let transport = HttpTransport::new(endpoints.clone(), config.request_timeout)?;
    Ok(Poller::new(Gateway::new(transport, config.window_size)))
}

/// Re-reads the settings so a `configure` from another shell applies on the next tick.
fn spawn_settings_reload(
    source: CredentialSource,
    config_tx: watch::Sender<Credentials>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SETTINGS_RELOAD);
        loop {
            ticker.tick().await;
            match source.load() {
                Ok(fresh) => {
                    config_tx.send_if_modified(|current| {
                        if *current == fresh {
                            return false;
                        }
                        info!("settings changed, next tick uses them");
                        *current = fresh;
                        true
                    });
                }
                Err(err) => warn!(error = %err, "failed to reload settings"),
            }
        }
    })
}

async fn stream_loop<T: FeedTransport + 'static>(
    poller: &mut Poller<T>,
    source: &CredentialSource,
    interval: Duration,
    format: OutputFormat,
) -> Result<()> {
    let mut updates = poller.subscribe();
    let (config_tx, config_rx) = watch::channel(source.load()?);
    let reload = spawn_settings_reload(source.clone(), config_tx);
    poller.start(config_rx, interval);

    let mut last_printed = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.status.is_none() || snapshot.tick == last_printed {
                    continue;
                }
                last_printed = snapshot.tick;
                print_snapshot(&snapshot, format)?;
                info!(
                    tick = snapshot.tick,
                    samples = snapshot.series.len(),
                    stale_dropped = snapshot.quality.stale_dropped,
                    "tick"
                );
            }
        }
    }

    poller.stop();
    reload.abort();
    Ok(())
}

fn masked(config: &DeviceConfig) -> DeviceConfig {
    let mask = |secret: &str| {
        if secret.is_empty() {
            String::new()
        } else {
            let tail: String = secret
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("****{tail}")
        }
    };

    DeviceConfig {
        channel_id: config.channel_id.clone(),
        read_key: mask(&config.read_key),
        write_key: mask(&config.write_key),
        wifi_ssid: config.wifi_ssid.clone(),
        wifi_pass: mask(&config.wifi_pass),
    }
}

fn print_outcome(outcome: &ReadingsOutcome, format: OutputFormat) -> Result<()> {
    let series: &[NormalizedSample] = match outcome {
        ReadingsOutcome::Ok(series) => series.as_slice(),
        _ => &[],
    };
    let banner = outcome.banner();

    match format {
        OutputFormat::Json | OutputFormat::Ndjson => {
            let out = serde_json::json!({
                "status": banner,
                "latest": latest_metrics(series),
                "series": series,
            });
            if matches!(format, OutputFormat::Json) {
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("{}", serde_json::to_string(&out)?);
            }
        }
        OutputFormat::Human => {
            print_banner(&banner);
            if !series.is_empty() {
                print_latest(&latest_metrics(series), series.len());
            }
        }
    }

    Ok(())
}

fn print_snapshot(snapshot: &PollSnapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(snapshot)?);
        }
        OutputFormat::Ndjson => {
            println!("{}", serde_json::to_string(snapshot)?);
        }
        OutputFormat::Human => {
            println!("=== Smart Water Snapshot ===");
            println!("Time:       {}", snapshot.ts.to_rfc3339());
            println!(
                "Tick:       {} (ok={} err={} stale_dropped={})",
                snapshot.tick,
                snapshot.quality.polls_ok,
                snapshot.quality.polls_err,
                snapshot.quality.stale_dropped,
            );
            if let Some(banner) = &snapshot.status {
                print_banner(banner);
            }
            if !snapshot.series.is_empty() {
                print_latest(&snapshot.latest, snapshot.series.len());
            }
        }
    }

    Ok(())
}

fn print_banner(banner: &Banner) {
    match banner.action {
        Some(action) => println!("Status:     {:?} {} [{:?}]", banner.kind, banner.message, action),
        None => println!("Status:     {:?} {}", banner.kind, banner.message),
    }
}

fn print_latest(latest: &NormalizedSample, window: usize) {
    println!("Latest:     #{} at {} ({} samples in window)", latest.entry_id, latest.time, window);
    for (idx, field) in FIELD_TABLE.iter().enumerate() {
        let Some(value) = latest.value(idx) else {
            continue;
        };
        let shown = match field.kind {
            FieldKind::Binary if value > 0.5 => "ON".to_string(),
            FieldKind::Binary => "OFF".to_string(),
            FieldKind::Numeric => format!("{value:.2} {}", field.unit),
        };
        println!("  F{} {:<14} {}", idx + 1, field.label, shown.trim_end());
    }
}
