use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use media_queue::client::{self, ApiClient};
use media_queue::core::config::AppConfig;
use media_queue::core::model::{Mode, Source};
use media_queue::core::security::TokenStore;
use media_queue::core::store::TaskStore;
use media_queue::core::worker::Worker;
use media_queue::plugins::registry::{DriverContext, DriverRegistry};
use media_queue::server::{self, AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn build_cli() -> Command {
    let serve = Command::new("serve").about("Run the queue worker and the REST control plane");

    let add = Command::new("add")
        .about("Queue a URL on a running server")
        .arg(Arg::new("url").help("Media URL").required(true).num_args(1))
        .arg(
            Arg::new("source")
                .long("source")
                .help("Origin tag (GUI, FILE, EXT, MOBILE, API, ...)")
                .default_value("API")
                .num_args(1),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .help("VIDEO or PLAYLIST")
                .default_value("VIDEO")
                .num_args(1),
        );

    let control = Command::new("control")
        .about("Send a control action")
        .arg(
            Arg::new("action")
                .help("pause_worker | resume_worker | restart_worker | cancel_current | restart_all | retry | delete")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("task_id")
                .long("task-id")
                .help("Task for retry / delete")
                .value_parser(clap::value_parser!(i64))
                .num_args(1),
        );

    let state = Command::new("state").about("Print worker state and per-source counters");

    let watch = Command::new("watch")
        .about("Live progress of the most recent tasks")
        .arg(
            Arg::new("interval_ms")
                .long("interval-ms")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("limit")
                .long("limit")
                .default_value("20")
                .value_parser(clap::value_parser!(i64))
                .num_args(1),
        );

    let token = Command::new("token").about("Show the access token digest").arg(
        Arg::new("rotate")
            .long("rotate")
            .help("Replace the token with a new random one")
            .action(ArgAction::SetTrue),
    );

    AppConfig::augment_command(
        Command::new("media-queue")
            .about("Single-worker media download queue with a REST control plane")
            .version(env!("CARGO_PKG_VERSION"))
            .subcommand_required(true)
            .arg_required_else_help(true),
    )
    .subcommand(serve)
    .subcommand(add)
    .subcommand(control)
    .subcommand(state)
    .subcommand(watch)
    .subcommand(token)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();
    let cfg = Arc::new(AppConfig::from_matches(&matches)?);
    init_logging(&cfg.log_level);

    match matches.subcommand() {
        Some(("serve", _)) => serve(cfg).await,
        Some(("add", m)) => add(&cfg, m).await,
        Some(("control", m)) => {
            let action = m.get_one::<String>("action").context("missing action")?;
            let task_id = m.get_one::<i64>("task_id").copied();
            let resp = ApiClient::from_config(&cfg).await?.control(action, task_id).await?;
            println!("{}", resp.detail);
            Ok(())
        }
        Some(("state", _)) => {
            let api = ApiClient::from_config(&cfg).await?;
            let s = api.worker_state().await?;
            println!(
                "paused={} current_task={} restart_in_progress={} running={}",
                s.worker_paused,
                s.current_task_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                s.restart_in_progress,
                s.running
            );
            for c in api.counters().await?.counters {
                println!("  {:<10} last_local_id={}", c.source, c.last_local_id);
            }
            Ok(())
        }
        Some(("watch", m)) => {
            let every = Duration::from_millis(m.get_one::<u64>("interval_ms").copied().unwrap_or(1000).max(100));
            let limit = m.get_one::<i64>("limit").copied().unwrap_or(20);
            let api = ApiClient::from_config(&cfg).await?;
            client::watch(&api, every, limit).await
        }
        Some(("token", m)) => {
            let tokens = TokenStore::new(&cfg.paths.token_path);
            if m.get_flag("rotate") {
                tokens.create().await?;
            }
            println!("token file: {}", tokens.path().display());
            println!("sha256:     {}", tokens.digest().await?);
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn add(cfg: &AppConfig, m: &ArgMatches) -> anyhow::Result<()> {
    let url = m.get_one::<String>("url").context("missing url")?;
    let source = m.get_one::<String>("source").map(String::as_str).unwrap_or("API");
    let mode = m.get_one::<String>("mode").map(String::as_str).unwrap_or("VIDEO");
    if Mode::parse(mode).is_none() {
        eprintln!("unknown mode {mode}, the server will use VIDEO");
    }

    let resp = ApiClient::from_config(cfg).await?.enqueue(url, Source::parse(source).as_str(), mode).await?;
    match (resp.task_id, resp.display_id) {
        (Some(id), Some(tag)) => println!("queued #{id} ({tag})"),
        (Some(id), None) => println!("queued #{id}"),
        _ => println!("{}", resp.detail),
    }
    Ok(())
}

async fn serve(cfg: Arc<AppConfig>) -> anyhow::Result<()> {
    let store = TaskStore::open(&cfg.paths.db_path)
        .await
        .with_context(|| format!("open {}", cfg.paths.db_path.display()))?;
    let tokens = TokenStore::new(&cfg.paths.token_path);
    tokens.load_or_create().await?;

    tokio::fs::create_dir_all(&cfg.paths.downloads_dir)
        .await
        .with_context(|| format!("create {}", cfg.paths.downloads_dir.display()))?;
    let registry = Arc::new(DriverRegistry::with_defaults(Arc::new(DriverContext::from_config(&cfg))));
    let worker = Worker::new(store.clone(), registry, cfg.worker);
    worker.start().await?;

    let app = server::router(AppState { store, worker: worker.clone(), tokens, config: cfg.clone() });
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(url = %cfg.server_url(), name = %cfg.server.name, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    worker.stop().await;
    info!("bye");
    Ok(())
}
