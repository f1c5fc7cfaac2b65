mod api;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use conntracker::loader::{self, AttachMode};
use guarder_core::metrics::Metrics;
use guarder_core::store::{MemoryTable, RuleStore, RuleTable};
use guarder_core::synth::{
    DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_TEMPERATURE, DEFAULT_TIMEOUT_SECS, GenerationConfig,
    Synthesizer,
};
use guarder_core::telemetry::{StaticTelemetry, TelemetryReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "guarder-agent",
    about = "XDP packet filter control plane with AI-assisted rule synthesis"
)]
struct Cli {
    /// Network interface to attach the XDP connection tracker to.
    #[arg(long, required_unless_present = "dry_run")]
    interface: Option<String>,

    /// Path to the compiled XDP object.
    #[arg(long, default_value = "bpf/conn_tracker.o")]
    bpf_object: PathBuf,

    /// XDP attach mode: default, skb, driver or hardware.
    #[arg(long, default_value_t = AttachMode::Default)]
    xdp_mode: AttachMode,

    /// Address the HTTP API binds to.
    #[arg(long, default_value = "0.0.0.0")]
    api_addr: IpAddr,

    /// HTTP port for the API, metrics and health probes.
    #[arg(long, default_value_t = 8080)]
    api_port: u16,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Serve the API without loading eBPF: rules go to an in-memory table
    /// and telemetry is empty.
    #[arg(long)]
    dry_run: bool,

    /// Chat-completion endpoint used for rule synthesis.
    #[arg(long, env = "GUARDER_AI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    ai_endpoint: String,

    /// Model requested from the generation service.
    #[arg(long, env = "GUARDER_AI_MODEL", default_value = DEFAULT_MODEL)]
    ai_model: String,

    /// API key for the generation service. Can also be set at runtime via
    /// POST /api/ai/config.
    #[arg(long, env = "GUARDER_AI_API_KEY", default_value = "", hide_env_values = true)]
    ai_api_key: String,

    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    ai_temperature: f64,

    /// Generation request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    ai_timeout: u64,

    /// Log prompts, digests and raw responses at info level.
    #[arg(long)]
    ai_debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(interface = ?cli.interface, api_port = cli.api_port, dry_run = cli.dry_run, "starting guarder-agent");

    // Pre-flight: claim the API port before attaching anything.
    let listener = api::bind(SocketAddr::new(cli.api_addr, cli.api_port)).await?;

    let metrics = Arc::new(Metrics::new());

    // The loaded object owns the attachment; keep it until shutdown.
    let (_ebpf, table, reader): (_, Box<dyn RuleTable>, Arc<dyn TelemetryReader>) =
        match cli.interface.as_deref().filter(|_| !cli.dry_run) {
            Some(iface) => {
                let (ebpf, table, reader) =
                    loader::load_and_attach(&cli.bpf_object, iface, cli.xdp_mode)
                        .context("failed to start connection tracker")?;
                (Some(ebpf), Box::new(table), Arc::new(reader))
            }
            None => {
                warn!("dry run: eBPF not loaded, rules are kept in memory only");
                (
                    None,
                    Box::new(MemoryTable::new()),
                    Arc::new(StaticTelemetry::default()),
                )
            }
        };

    let store = Arc::new(RuleStore::new(table, metrics.clone()));

    let config = GenerationConfig {
        endpoint: cli.ai_endpoint,
        api_key: cli.ai_api_key,
        model: cli.ai_model,
        temperature: cli.ai_temperature,
        timeout_secs: cli.ai_timeout,
        debug: cli.ai_debug,
    };
    let synth = Arc::new(
        Synthesizer::new(config, metrics.clone()).context("failed to build generation client")?,
    );
    if !synth.status().is_configured {
        info!("no generation api key set, rule synthesis disabled until configured");
    }

    let state = api::ApiState {
        store,
        reader,
        synth,
        metrics,
    };
    let mut api_handle = tokio::spawn(api::serve(listener, state));

    info!("guarder-agent running");

    // Wait for shutdown signal (SIGINT or SIGTERM), or for the API to die.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
        res = &mut api_handle => {
            res.context("HTTP API task panicked")?
                .context("HTTP API server failed")?;
            anyhow::bail!("HTTP API stopped unexpectedly");
        }
    }

    info!("shutting down...");
    api_handle.abort();

    info!("guarder-agent stopped");
    Ok(())
}
