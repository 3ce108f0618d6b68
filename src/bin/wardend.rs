use std::{
    io::{self, BufReader},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use egress_warden::{
    AppConfig, RuleEngine,
    attributor::process_attributor,
    enforcer::platform_enforcer,
    ipc::{
        self, AddRuleRequest, AppStatsInfo, AttemptInfo, ErrorResponse, RemoveStatusWire, Request,
        Response, RuleInfo, SOCKET_ENV_VAR, StatusResponse, read_json_line, write_json_line,
    },
    monitor::{MonitorConfig as LoopConfig, MonitorLoop},
    proxy::L7Proxy,
    store::Store,
};
use interprocess::local_socket::{GenericNamespaced, ListenerNonblockingMode, ListenerOptions, prelude::*};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "wardend")]
struct Cli {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(long)]
    socket: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

struct State {
    started_at: Instant,
    config_path: PathBuf,
    socket: String,
    cfg: ArcSwap<AppConfig>,
    running: AtomicBool,
    engine: Arc<RuleEngine>,
    monitor: Arc<MonitorLoop>,
    monitor_cancel: Arc<AtomicBool>,
    proxy_stop: Option<Arc<AtomicBool>>,
    ipc_requests: AtomicU64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = match AppConfig::load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config: {e:#}");
            std::process::exit(1);
        }
    };

    let store = Arc::new(
        Store::open(std::path::Path::new(&cfg.store.path)).context("failed to open store")?,
    );

    let enforcer = platform_enforcer();
    if let Err(e) = enforcer.cleanup_all() {
        warn!(error = %e, "startup cleanup of stale kernel state failed");
    }

    let staleness = Duration::from_secs(cfg.monitor.staleness_secs);
    let engine = match RuleEngine::new(Arc::clone(&store), enforcer, staleness) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to initialize rule engine: {e}");
            std::process::exit(1);
        }
    };

    let attributor = process_attributor();
    let monitor = Arc::new(MonitorLoop::new(
        Arc::clone(&engine),
        attributor,
        LoopConfig {
            tick_period: Duration::from_millis(cfg.monitor.tick_ms),
            domain_refresh_every_ticks: cfg.monitor.domain_refresh_every_ticks,
        },
    ));
    let monitor_cancel = monitor.cancel_handle();
    let _monitor_handle = Arc::clone(&monitor).spawn();

    let proxy_stop = if cfg.proxy.enabled {
        let proxy_attributor = process_attributor();
        let proxy = Arc::new(L7Proxy::new(Arc::clone(&engine), proxy_attributor, cfg.proxy.listen.clone()));
        let stop = proxy.stop_handle();
        match proxy.spawn() {
            Ok(_handle) => Some(stop),
            Err(e) => {
                warn!(error = %e, "failed to start l7 proxy, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let socket_label = resolve_socket_label(cli.socket.as_deref());

    let state = Arc::new(State {
        started_at: Instant::now(),
        config_path: cli.config,
        socket: socket_label,
        cfg: ArcSwap::from_pointee(cfg),
        running: AtomicBool::new(true),
        engine,
        monitor,
        monitor_cancel,
        proxy_stop,
        ipc_requests: AtomicU64::new(0),
    });

    ctrlc::set_handler({
        let state = Arc::clone(&state);
        move || {
            state.running.store(false, Ordering::SeqCst);
        }
    })
    .context("failed to set Ctrl+C handler")?;

    let (name, fs_socket_path) = ipc::socket_name_with_override(cli.socket.as_deref())?;
    cleanup_fs_socket(fs_socket_path.as_ref());

    let listener = ListenerOptions::new()
        .name(name)
        .nonblocking(ListenerNonblockingMode::Accept)
        .create_sync()
        .context("failed to create IPC listener")?;

    info!("wardend started");

    while state.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(conn) => {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    if let Err(e) = handle_conn(&state, conn) {
                        warn!(error = %format!("{e:#}"), "ipc error");
                    }
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                warn!(error = %e, "accept error");
                thread::sleep(Duration::from_millis(50));
            }
        }
    }

    info!("wardend stopping");
    state.monitor_cancel.store(true, Ordering::SeqCst);
    if let Some(stop) = &state.proxy_stop {
        stop.store(true, Ordering::SeqCst);
    }
    cleanup_fs_socket(fs_socket_path.as_ref());

    Ok(())
}

fn resolve_socket_label(cli_socket: Option<&str>) -> String {
    let env_socket = std::env::var(SOCKET_ENV_VAR).ok();
    let override_socket = cli_socket.or(env_socket.as_deref());

    override_socket.map_or_else(
        || {
            if GenericNamespaced::is_supported() {
                ipc::SOCKET_PRINT_NAME.to_owned()
            } else {
                ipc::SOCKET_FS_FALLBACK.to_owned()
            }
        },
        str::to_owned,
    )
}

fn cleanup_fs_socket(path: Option<&PathBuf>) {
    if let Some(p) = path {
        let _ = std::fs::remove_file(p);
    }
}

fn handle_conn(state: &Arc<State>, mut conn: interprocess::local_socket::Stream) -> Result<()> {
    let req: Request = read_json_line(BufReader::new(&mut conn))?;
    state.ipc_requests.fetch_add(1, Ordering::SeqCst);
    let resp = handle_request(state, req);
    write_json_line(&mut conn, &resp)?;
    Ok(())
}

fn handle_request(state: &State, req: Request) -> Response {
    match req {
        Request::AddRule(AddRuleRequest { app, target }) => match state.engine.add(&app, &target) {
            Ok(rule_id) => Response::OkAddRule { rule_id },
            Err(e) => err_response(e),
        },
        Request::RemoveRule { rule_id } => match state.engine.remove(rule_id) {
            Ok(status) => Response::OkRemoveRule {
                status: map_remove_status(status),
            },
            Err(e) => err_response(e),
        },
        Request::ListActive => match state.engine.list_active() {
            Ok(rules) => Response::OkListActive {
                rules: rules.iter().map(rule_to_wire).collect(),
            },
            Err(e) => err_response(e),
        },
        Request::Stats => {
            let apps = state
                .monitor
                .stats_snapshot()
                .into_iter()
                .map(|(app, stats)| AppStatsInfo {
                    app,
                    connections: stats.connections,
                    blocked_attempts: stats.blocked_attempts,
                    unique_destinations: stats.unique_destinations.len() as u64,
                    first_seen: stats.first_seen.map(|_| "tracked".to_owned()),
                })
                .collect();
            Response::OkStats { apps }
        }
        Request::TailAttempts { count } => match state.engine.store().tail_attempts(count) {
            Ok(attempts) => Response::OkTailAttempts {
                attempts: attempts
                    .into_iter()
                    .map(|a| AttemptInfo {
                        id: a.id,
                        rule_id: a.rule_id,
                        timestamp: a.timestamp,
                        app: a.app,
                        source: a.source,
                        target: a.target,
                        detail: a.detail,
                    })
                    .collect(),
            },
            Err(e) => err_response(e),
        },
        Request::Status => Response::OkStatus(build_status(state)),
        Request::Reload => match reload_config(state) {
            Ok(()) => {
                info!("reloaded config");
                Response::OkReload
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "reload failed");
                Response::Err(ErrorResponse {
                    message: format!("reload failed for {}: {:#}", state.config_path.display(), e),
                })
            }
        },
        Request::Stop => {
            state.running.store(false, Ordering::SeqCst);
            info!("stop requested");
            Response::OkStop
        }
    }
}

fn rule_to_wire(rule: &egress_warden::store::Rule) -> RuleInfo {
    RuleInfo {
        id: rule.id,
        app: rule.app.clone(),
        target: rule.target.clone(),
        target_kind: rule.target_kind.to_string(),
        resolved_ips: rule.all_ips(),
        created_at: rule.created_at.clone(),
    }
}

const fn map_remove_status(status: egress_warden::engine::RemoveStatus) -> RemoveStatusWire {
    match status {
        egress_warden::engine::RemoveStatus::Ok => RemoveStatusWire::Ok,
        egress_warden::engine::RemoveStatus::NotFound => RemoveStatusWire::NotFound,
        egress_warden::engine::RemoveStatus::Partial => RemoveStatusWire::Partial,
    }
}

fn err_response(e: egress_warden::WardenError) -> Response {
    Response::Err(ErrorResponse { message: e.to_string() })
}

fn build_status(state: &State) -> StatusResponse {
    let active = state.engine.list_active().map(|r| r.len()).unwrap_or(0);
    StatusResponse {
        uptime_ms: state.started_at.elapsed().as_millis(),
        config_path: state.config_path.display().to_string(),
        socket: state.socket.clone(),
        active_rule_count: active,
        running: state.running.load(Ordering::SeqCst),
    }
}

fn reload_config(state: &State) -> Result<()> {
    let next = AppConfig::load_from_path(&state.config_path)
        .with_context(|| format!("failed to load config {}", state.config_path.display()))?;
    state.cfg.store(Arc::new(next));
    Ok(())
}
