use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time;

use crate::spectral::backend::BackendAgent;
use crate::spectral::manager::{DomainMap, WorkerManager};
use crate::spectral::protocol::disconnect_packet;
use crate::spectral::worker::{start_workers, WorkerConfig};
use crate::spectral::{admin, config, listener, logging, net, telemetry};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;
    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let prometheus = Arc::new(telemetry::init_prometheus()?);
    let sessions = Arc::new(telemetry::SessionRegistry::new());
    let work_group = Arc::new(telemetry::WorkGroup::new());

    let mut manager = WorkerManager::new();
    let registered = register_backends(&mut manager, &cfg);
    if registered == 0 {
        tracing::warn!("spectral: no backends registered; only the default status will be served");
    }

    let worker_cfg = WorkerConfig {
        io_timeout: cfg.io_deadline,
        reply_timeout: reply_timeout(&cfg),
        accept_proxy_protocol: cfg.accept_proxy_protocol,
        default_status_packet: cfg.default_status.marshal().encode(),
        verify_disconnect_packet: disconnect_packet(&cfg.verify_conn_msg).encode(),
    };
    let (inbound_tx, inbound_rx) = mpsc::channel(cfg.number_of_workers.max(16));
    start_workers(
        cfg.number_of_workers,
        worker_cfg,
        manager.shared(),
        inbound_rx,
        sessions.clone(),
        work_group.clone(),
    );

    let bind = net::normalize_bind_addr(&cfg.listen_to).to_string();
    let socket = Arc::new(
        TcpListener::bind(&bind)
            .await
            .with_context(|| format!("bind {bind}"))?,
    );

    tracing::info!(
        config = %resolved.path.display(),
        listen = %bind,
        workers = cfg.number_of_workers,
        listeners = cfg.number_of_listeners,
        backends = registered,
        domains = manager.domain_count(),
        "spectral: starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_tx, reload_rx) = watch::channel(telemetry::ReloadSignal::new());

    let mut tasks = JoinSet::new();

    for _ in 0..cfg.number_of_listeners {
        tasks.spawn(listener::serve(
            socket.clone(),
            inbound_tx.clone(),
            shutdown_rx.clone(),
        ));
    }
    // Workers drain and exit once the last listener drops its queue handle.
    drop(inbound_tx);

    if !cfg.admin_addr.is_empty() {
        let admin_addr: SocketAddr = net::normalize_bind_addr(&cfg.admin_addr)
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prometheus: prometheus.clone(),
            sessions: sessions.clone(),
            config_path: resolved.path.clone(),
            reload_tx: reload_tx.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(admin::serve_with_shutdown(admin_addr, state, shutdown));
    }

    // Config reload loop (file polling + admin-triggered).
    {
        let path = resolved.path.clone();
        let listen_to = cfg.listen_to.clone();
        let reload_cfg = cfg.reload.clone();
        let reload_rx = reload_rx.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            reload_loop(path, listen_to, manager, reload_cfg, reload_rx, shutdown).await;
            Ok(())
        });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain: remaining service tasks first, then live spliced connections.
    let drain = async {
        while tasks.join_next().await.is_some() {}
        work_group.wait_idle().await;
    };
    if time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!(active = work_group.active(), "shutdown: drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

/// Spawn an agent per configured backend and register its domains. A backend
/// that fails to bind (typically: RealIP enabled but no key obtainable) is
/// logged and skipped; the process keeps serving the others.
fn register_backends(manager: &mut WorkerManager, cfg: &config::Config) -> usize {
    let mut registered = 0;
    for backend in &cfg.backends {
        match backend.bind(&cfg.config_dir) {
            Ok(bound) => {
                let name = bound.name.clone();
                manager.add_backend(&backend.domains, BackendAgent::spawn(bound));
                tracing::info!(backend = %name, domains = ?backend.domains, "spectral: backend registered");
                registered += 1;
            }
            Err(err) => {
                tracing::error!(backend = %backend.name, err = %err, "spectral: backend skipped");
            }
        }
    }
    registered
}

/// Worker-side bound on waiting for an agent decision: the agent may dial and
/// run a status exchange before answering.
fn reply_timeout(cfg: &config::Config) -> Duration {
    let max_dial = cfg
        .backends
        .iter()
        .map(|b| b.dial_timeout)
        .max()
        .unwrap_or(Duration::from_secs(1));
    cfg.io_deadline + max_dial * 2 + Duration::from_millis(500)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn reload_loop(
    config_path: PathBuf,
    listen_to: String,
    mut manager: WorkerManager,
    mut reload_cfg: config::ReloadConfig,
    mut reload_rx: watch::Receiver<telemetry::ReloadSignal>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_sig = file_sig(&config_path).ok();

    loop {
        let sleep_dur = if reload_cfg.enabled {
            reload_cfg.poll_interval.max(Duration::from_millis(200))
        } else {
            Duration::from_secs(3600)
        };

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = reload_rx.changed() => {
                apply_reload(&config_path, &listen_to, &mut manager, &mut reload_cfg);
                last_sig = file_sig(&config_path).ok();
            }
            _ = time::sleep(sleep_dur) => {
                if !reload_cfg.enabled {
                    continue;
                }
                let sig = match file_sig(&config_path) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                if last_sig.is_some_and(|prev| prev == sig) {
                    continue;
                }
                apply_reload(&config_path, &listen_to, &mut manager, &mut reload_cfg);
                last_sig = Some(sig);
            }
        }
    }
}

/// Re-read the config and atomically republish the domain map. A load error
/// keeps the running set; changed/unchanged backends alike get fresh agents
/// while old ones drain behind the swapped snapshot.
fn apply_reload(
    config_path: &PathBuf,
    listen_to: &str,
    manager: &mut WorkerManager,
    reload_cfg: &mut config::ReloadConfig,
) {
    let cfg = match config::load_config(config_path) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), err = %err, "reload: config load failed; keeping old config");
            return;
        }
    };

    if cfg.listen_to.trim() != listen_to.trim() {
        tracing::warn!("reload: listen_to changed; restart required to apply it");
    }

    let mut domains = DomainMap::new();
    let mut registered = 0;
    for backend in &cfg.backends {
        match backend.bind(&cfg.config_dir) {
            Ok(bound) => {
                let inbox = BackendAgent::spawn(bound);
                for domain in &backend.domains {
                    domains.insert(domain.clone(), inbox.clone());
                }
                registered += 1;
            }
            Err(err) => {
                tracing::error!(backend = %backend.name, err = %err, "reload: backend skipped");
            }
        }
    }
    manager.replace(domains);

    reload_cfg.enabled = cfg.reload.enabled;
    reload_cfg.poll_interval = cfg.reload.poll_interval;

    tracing::info!(backends = registered, domains = manager.domain_count(), "reload: applied");
}

fn file_sig(path: &PathBuf) -> anyhow::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let len = meta.len();
    let modified = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok((modified, len))
}
