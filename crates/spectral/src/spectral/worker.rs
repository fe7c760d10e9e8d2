use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;

use crate::spectral::backend::{Action, BackendRequest, RequestData, RequestKind};
use crate::spectral::manager::SharedDomains;
use crate::spectral::protocol::{
    decode_login_start, read_packet, read_packet_raw, Handshake, NEXT_STATE_LOGIN,
    NEXT_STATE_STATUS, PING_ID, STATUS_REQUEST_ID,
};
use crate::spectral::proxyproto;
use crate::spectral::telemetry::{self, SharedSessions, WorkGroup};

/// Static worker-pool settings, shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub io_timeout: Duration,
    /// Upper bound on waiting for an agent's Action; covers the agent's own
    /// dial and status-exchange budget plus slack.
    pub reply_timeout: Duration,
    pub accept_proxy_protocol: bool,
    /// Served to status requests for unknown domains.
    pub default_status_packet: Vec<u8>,
    /// Sent to login attempts for unknown domains.
    pub verify_disconnect_packet: Vec<u8>,
}

/// An accepted connection on its way to a worker.
#[derive(Debug)]
pub struct Inbound {
    pub stream: TcpStream,
    pub client_addr: SocketAddr,
}

/// Start `count` workers competing for connections on a shared queue.
pub fn start_workers(
    count: usize,
    cfg: WorkerConfig,
    domains: SharedDomains,
    inbound: mpsc::Receiver<Inbound>,
    sessions: SharedSessions,
    work_group: Arc<WorkGroup>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let cfg = Arc::new(cfg);
    let inbound = Arc::new(Mutex::new(inbound));

    (0..count)
        .map(|_| {
            let worker = Worker {
                cfg: cfg.clone(),
                domains: domains.clone(),
                inbound: inbound.clone(),
                sessions: sessions.clone(),
                work_group: work_group.clone(),
            };
            tokio::spawn(worker.run())
        })
        .collect()
}

pub struct Worker {
    cfg: Arc<WorkerConfig>,
    domains: SharedDomains,
    inbound: Arc<Mutex<mpsc::Receiver<Inbound>>>,
    sessions: SharedSessions,
    work_group: Arc<WorkGroup>,
}

impl Worker {
    async fn run(self) {
        loop {
            let inbound = {
                let mut rx = self.inbound.lock().await;
                match rx.recv().await {
                    Some(inbound) => inbound,
                    None => break,
                }
            };
            self.serve(inbound).await;
        }
    }

    /// Handle one accepted connection through handshake, dispatch and the
    /// returned action. Decode errors, timeouts and unexpected packets close
    /// the client silently.
    async fn serve(&self, inbound: Inbound) {
        let Inbound {
            mut stream,
            mut client_addr,
        } = inbound;
        let io = self.cfg.io_timeout;

        if self.cfg.accept_proxy_protocol {
            match time::timeout(io, proxyproto::read_header(&mut stream)).await {
                Ok(Ok(Some(source))) => client_addr = source,
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    tracing::debug!(client = %client_addr, err = %err, "worker: bad proxy protocol header");
                    return;
                }
                Err(_) => return,
            }
        }

        let (handshake_packet, handshake_raw) =
            match time::timeout(io, read_packet_raw(&mut stream)).await {
                Ok(Ok(v)) => v,
                Ok(Err(err)) => {
                    tracing::debug!(client = %client_addr, err = %err, "worker: handshake read failed");
                    return;
                }
                Err(_) => return,
            };
        let handshake = match Handshake::decode(&handshake_packet) {
            Ok(h) => h,
            Err(err) => {
                tracing::debug!(client = %client_addr, err = %err, "worker: handshake decode failed");
                return;
            }
        };

        let kind = match handshake.next_state {
            NEXT_STATE_STATUS => RequestKind::Status,
            NEXT_STATE_LOGIN => RequestKind::Login,
            _ => return,
        };
        let host = normalize_virtual_host(&handshake.server_address);

        let Some(agent) = self.domains.load().get(&host).cloned() else {
            metrics::counter!("spectral_unknown_domain_total").increment(1);
            self.serve_unknown_domain(stream, kind).await;
            return;
        };

        // The follow-up packet: StatusRequest or LoginStart.
        let (follow_packet, follow_raw) =
            match time::timeout(io, read_packet_raw(&mut stream)).await {
                Ok(Ok(v)) => v,
                _ => return,
            };
        let username = match kind {
            RequestKind::Status => {
                if follow_packet.id != STATUS_REQUEST_ID {
                    return;
                }
                String::new()
            }
            _ => match decode_login_start(&follow_packet) {
                Ok(name) => name,
                Err(err) => {
                    tracing::debug!(client = %client_addr, err = %err, "worker: login start decode failed");
                    return;
                }
            },
        };

        let data = RequestData {
            kind,
            client_addr,
            server_address: host.clone(),
            protocol_version: handshake.protocol_version,
            username,
            handshake_packet: handshake_raw,
            read_ahead: follow_raw,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if agent
            .send(BackendRequest {
                data,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            tracing::warn!(host = %host, "worker: backend inbox closed");
            return;
        }
        let action = match time::timeout(self.cfg.reply_timeout, reply_rx).await {
            Ok(Ok(action)) => action,
            _ => {
                tracing::warn!(host = %host, "worker: no action from backend agent");
                return;
            }
        };

        match action {
            Action::SendStatus { packet } => {
                let _ = self.answer_status(&mut stream, &packet).await;
            }
            Action::Disconnect { packet } => {
                let _ = time::timeout(io, stream.write_all(&packet)).await;
            }
            Action::Close => {}
            Action::Proxy {
                dialer,
                send_proxy_protocol,
                handshake,
                read_ahead,
            } => {
                self.spawn_splice(
                    stream,
                    client_addr,
                    host,
                    dialer,
                    send_proxy_protocol,
                    handshake,
                    read_ahead,
                );
            }
        }
    }

    async fn serve_unknown_domain(&self, mut stream: TcpStream, kind: RequestKind) {
        let io = self.cfg.io_timeout;
        match kind {
            RequestKind::Status => {
                // Consume the StatusRequest first, then answer locally.
                match time::timeout(io, read_packet(&mut stream)).await {
                    Ok(Ok(packet)) if packet.id == STATUS_REQUEST_ID => {}
                    _ => return,
                }
                let packet = self.cfg.default_status_packet.clone();
                let _ = self.answer_status(&mut stream, &packet).await;
            }
            _ => {
                let _ = time::timeout(io, stream.write_all(&self.cfg.verify_disconnect_packet)).await;
            }
        }
    }

    /// Write a status response, then serve the follow-up ping round so the
    /// client gets its latency figure. Clients occasionally re-send a
    /// StatusRequest before pinging; tolerate one.
    async fn answer_status(&self, stream: &mut TcpStream, packet: &[u8]) -> std::io::Result<()> {
        let io = self.cfg.io_timeout;
        time::timeout(io, stream.write_all(packet))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

        for _ in 0..2 {
            let packet = match time::timeout(io, read_packet(stream)).await {
                Ok(Ok(p)) => p,
                _ => return Ok(()),
            };
            if packet.id == PING_ID {
                let _ = time::timeout(io, stream.write_all(&packet.encode())).await;
                return Ok(());
            }
            if packet.id != STATUS_REQUEST_ID {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Dial the backend, replay the preamble and pump bytes until either side
    /// is done. Runs as its own task so the worker returns to its queue.
    #[allow(clippy::too_many_arguments)]
    fn spawn_splice(
        &self,
        mut client: TcpStream,
        client_addr: SocketAddr,
        host: String,
        dialer: crate::spectral::net::Dialer,
        send_proxy_protocol: bool,
        handshake: Vec<u8>,
        read_ahead: Vec<u8>,
    ) {
        let sessions = self.sessions.clone();
        let guard = self.work_group.open();

        tokio::spawn(async move {
            let _guard = guard;

            let mut backend = match dialer.dial().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::debug!(host = %host, backend = %dialer.addr, err = %err, "splice: backend dial failed");
                    metrics::counter!("spectral_backend_dial_errors_total").increment(1);
                    return;
                }
            };

            let mut preamble =
                Vec::with_capacity(handshake.len() + read_ahead.len() + 64);
            if send_proxy_protocol {
                let local = match backend.local_addr() {
                    Ok(addr) => addr,
                    Err(_) => return,
                };
                match proxyproto::encode_header(client_addr, local) {
                    Ok(header) => preamble.extend_from_slice(&header),
                    Err(err) => {
                        tracing::debug!(host = %host, err = %err, "splice: proxy header encode failed");
                        return;
                    }
                }
            }
            preamble.extend_from_slice(&handshake);
            preamble.extend_from_slice(&read_ahead);
            if backend.write_all(&preamble).await.is_err() {
                return;
            }

            let sid = telemetry::new_session_id();
            sessions.add(telemetry::SessionInfo {
                id: sid.clone(),
                client: client_addr.to_string(),
                host: host.clone(),
                backend: dialer.addr.clone(),
                started_at_unix_ms: telemetry::now_unix_ms(),
            });
            metrics::counter!("spectral_proxied_connections_total").increment(1);

            // No deadlines while spliced; EOF on one side half-closes the
            // other and the copy finishes when both directions are done.
            let result = tokio::io::copy_bidirectional(&mut client, &mut backend).await;
            sessions.remove(&sid);

            match result {
                Ok((from_client, from_backend)) => {
                    tracing::debug!(host = %host, from_client, from_backend, "splice: closed");
                }
                Err(err) => {
                    tracing::debug!(host = %host, err = %err, "splice: ended with error");
                }
            }
        });
    }
}

/// Dispatch key from the handshake's serverAddress: the first NUL-delimited
/// segment (BungeeCord/FML padding and RealIP suffixes follow it), without
/// port, lowercased, trailing dot stripped.
pub fn normalize_virtual_host(raw: &str) -> String {
    let host = raw.split('\0').next().unwrap_or_default();
    let host = match host.rsplit_once(':') {
        Some((head, tail))
            if !tail.is_empty()
                && tail.bytes().all(|b| b.is_ascii_digit())
                && !head.contains(':') =>
        {
            head
        }
        _ => host,
    };
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}
