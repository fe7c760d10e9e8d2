use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::spectral::config::{BackendConfig, StateOption};
use crate::spectral::limiter::{AbsoluteLimiter, BotFilterLimiter, ConnectionLimiter};
use crate::spectral::net::{split_host_port, Dialer};
use crate::spectral::protocol;
use crate::spectral::realip::{self, RealIpSigner};
use crate::spectral::state::{ServerState, StateAgent};
use crate::spectral::status::StatusCache;
use crate::spectral::telemetry;

/// How deep a backend's inbox queues before senders are pushed back.
const INBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Status,
    Login,
    Unknown,
}

/// One parsed client request, as handed from a worker to a backend agent.
#[derive(Debug, Clone)]
pub struct RequestData {
    pub kind: RequestKind,
    pub client_addr: SocketAddr,
    /// Virtual host: lowercased, port and any suffix after the first NUL
    /// stripped.
    pub server_address: String,
    pub protocol_version: i32,
    /// Empty for status requests.
    pub username: String,
    /// The handshake frame exactly as received.
    pub handshake_packet: Vec<u8>,
    /// Bytes already read past the handshake that the backend still needs:
    /// the LoginStart frame for logins, the StatusRequest frame for status
    /// pass-through.
    pub read_ahead: Vec<u8>,
}

#[derive(Debug)]
pub struct BackendRequest {
    pub data: RequestData,
    pub reply: oneshot::Sender<Action>,
}

/// The agent's decision for one request.
#[derive(Debug)]
pub enum Action {
    SendStatus {
        packet: Vec<u8>,
    },
    Disconnect {
        packet: Vec<u8>,
    },
    /// Splice to the backend. The worker dials, writes the preamble
    /// (PROXY-v2 header when asked, then `handshake`, then `read_ahead`) and
    /// pumps bytes.
    Proxy {
        dialer: Dialer,
        send_proxy_protocol: bool,
        handshake: Vec<u8>,
        read_ahead: Vec<u8>,
    },
    Close,
}

/// Per-backend agent: owns liveness, status cache and limiter state, and
/// serializes every decision for its backend through one inbox.
pub struct BackendAgent {
    name: String,
    dialer: Dialer,
    send_proxy_protocol: bool,
    real_ip_mode: Option<realip::RealIpMode>,
    real_ip_signer: Option<RealIpSigner>,
    state: StateAgent,
    status: Option<StatusCache>,
    limiter: ConnectionLimiter,
    disconnect_packet: Vec<u8>,
    offline_status_packet: Vec<u8>,
    rate_disconnect_packet: Vec<u8>,
}

impl BackendAgent {
    pub fn new(cfg: BackendConfig) -> Self {
        let dialer = Dialer::new(cfg.proxy_to.clone(), cfg.proxy_bind.clone(), cfg.dial_timeout);

        let state = match cfg.state_option {
            StateOption::AlwaysOnline => StateAgent::AlwaysOnline,
            StateOption::AlwaysOffline => StateAgent::AlwaysOffline,
            StateOption::Cache => {
                StateAgent::probing(dialer.clone(), cfg.state_update_cooldown)
            }
        };

        let status = cfg.cache_status.then(|| {
            let (host, port) = split_host_port(&cfg.proxy_to);
            StatusCache::new(
                cfg.valid_protocol,
                cfg.cache_update_cooldown,
                host,
                port,
                cfg.send_proxy_protocol,
                cfg.dial_timeout + Duration::from_secs(1),
            )
        });

        let limiter = if cfg.rate_limit == 0 {
            ConnectionLimiter::AlwaysAllow
        } else if cfg.limit_bots {
            ConnectionLimiter::BotFilter(BotFilterLimiter::new(
                cfg.rate_limit,
                cfg.rate_limit_duration,
                cfg.rate_ban_cooldown,
                cfg.unverify_cooldown,
            ))
        } else {
            ConnectionLimiter::Absolute(AbsoluteLimiter::new(
                cfg.rate_limit,
                cfg.rate_limit_duration,
                cfg.rate_limit_status,
            ))
        };

        let real_ip_mode = if cfg.use_new_real_ip {
            Some(realip::RealIpMode::New)
        } else if cfg.use_old_real_ip {
            Some(realip::RealIpMode::Old)
        } else {
            None
        };
        let real_ip_signer = match real_ip_mode {
            Some(realip::RealIpMode::New) => {
                // Invariant: checked at config conversion time.
                cfg.real_ip_key.as_ref().map(RealIpSigner::new)
            }
            _ => None,
        };

        Self {
            name: cfg.name,
            dialer,
            send_proxy_protocol: cfg.send_proxy_protocol,
            real_ip_mode,
            real_ip_signer,
            state,
            status,
            limiter,
            disconnect_packet: cfg.disconnect_packet,
            offline_status_packet: cfg.offline_status_packet,
            rate_disconnect_packet: cfg.rate_disconnect_packet,
        }
    }

    /// Spawn the agent task and hand back its inbox. The task exits once
    /// every sender is dropped and the inbox is drained.
    pub fn spawn(cfg: BackendConfig) -> mpsc::Sender<BackendRequest> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let agent = Self::new(cfg);
        tokio::spawn(agent.run(rx));
        tx
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<BackendRequest>) {
        tracing::debug!(backend = %self.name, "backend: agent started");
        while let Some(req) = inbox.recv().await {
            let action = self.handle(&req.data).await;
            if req.reply.send(action).is_err() {
                // Worker gave up waiting; nothing to undo beyond the limiter
                // increment that already happened.
                tracing::debug!(backend = %self.name, "backend: reply receiver dropped");
            }
        }
        tracing::debug!(backend = %self.name, "backend: agent drained, retiring");
    }

    async fn handle(&mut self, req: &RequestData) -> Action {
        if !self.limiter.allow(req) {
            metrics::counter!("spectral_requests_denied_total").increment(1);
            return match req.kind {
                RequestKind::Login => Action::Disconnect {
                    packet: self.rate_disconnect_packet.clone(),
                },
                _ => Action::Close,
            };
        }

        let state = self.state.state().await;
        match (state, req.kind) {
            (ServerState::Online, RequestKind::Status) => match &mut self.status {
                Some(cache) => match cache.status(&self.dialer).await {
                    Ok(packet) => Action::SendStatus { packet },
                    Err(err) => {
                        tracing::warn!(backend = %self.name, err = %err, "backend: status refresh failed");
                        Action::SendStatus {
                            packet: self.offline_status_packet.clone(),
                        }
                    }
                },
                None => self.proxy_action(req),
            },
            (ServerState::Online, RequestKind::Login) => self.proxy_action(req),
            (_, RequestKind::Status) => {
                let packet = self
                    .status
                    .as_ref()
                    .and_then(|cache| cache.fresh())
                    .unwrap_or_else(|| self.offline_status_packet.clone());
                Action::SendStatus { packet }
            }
            (_, RequestKind::Login) => Action::Disconnect {
                packet: self.disconnect_packet.clone(),
            },
            (_, RequestKind::Unknown) => Action::Close,
        }
    }

    fn proxy_action(&self, req: &RequestData) -> Action {
        let handshake = match self.real_ip_mode {
            None => req.handshake_packet.clone(),
            Some(_) => self.rewrite_handshake(req),
        };

        Action::Proxy {
            dialer: self.dialer.clone(),
            send_proxy_protocol: self.send_proxy_protocol,
            handshake,
            read_ahead: req.read_ahead.clone(),
        }
    }

    /// RealIP rewrite. The worker already decoded this frame once, so the
    /// fallback to the untouched bytes is a dead branch kept for safety.
    fn rewrite_handshake(&self, req: &RequestData) -> Vec<u8> {
        let Ok(packet) = protocol::decode_frame(&req.handshake_packet) else {
            return req.handshake_packet.clone();
        };
        let Ok(handshake) = protocol::Handshake::decode(&packet) else {
            return req.handshake_packet.clone();
        };

        realip::rewrite_handshake(
            &handshake,
            &req.server_address,
            req.client_addr,
            telemetry::now_unix_ms(),
            self.real_ip_signer.as_ref(),
        )
        .encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::protocol::{
        decode_frame, decode_login_start, disconnect_packet, put_string, Handshake, Packet,
        SimpleStatus, LOGIN_START_ID, NEXT_STATE_LOGIN, NEXT_STATE_STATUS,
    };
    use crate::spectral::realip::SEPARATOR;

    fn base_config() -> BackendConfig {
        BackendConfig {
            name: "example".into(),
            proxy_to: "127.0.0.1:25600".into(),
            proxy_bind: None,
            dial_timeout: Duration::from_millis(250),
            send_proxy_protocol: false,
            use_old_real_ip: false,
            use_new_real_ip: false,
            real_ip_key: None,
            state_option: StateOption::AlwaysOnline,
            state_update_cooldown: Duration::from_secs(5),
            cache_status: false,
            cache_update_cooldown: Duration::from_secs(60),
            valid_protocol: 765,
            offline_status_packet: SimpleStatus {
                name: "example".into(),
                protocol: 765,
                description: "Server is offline".into(),
            }
            .marshal()
            .encode(),
            disconnect_packet: disconnect_packet(r#"{"text": "Server is offline"}"#).encode(),
            rate_limit: 0,
            rate_limit_status: false,
            rate_limit_duration: Duration::from_secs(1),
            rate_ban_cooldown: Duration::from_secs(300),
            unverify_cooldown: Duration::from_secs(600),
            limit_bots: true,
            rate_disconnect_packet: disconnect_packet(
                r#"{"text": "Please reconnect to verify yourself"}"#,
            )
            .encode(),
        }
    }

    fn login_request() -> RequestData {
        let handshake = Handshake {
            protocol_version: 765,
            server_address: "example.local".into(),
            server_port: 25565,
            next_state: NEXT_STATE_LOGIN,
        };
        let mut login_data = Vec::new();
        put_string(&mut login_data, "alice");

        RequestData {
            kind: RequestKind::Login,
            client_addr: "203.0.113.5:54321".parse().expect("addr"),
            server_address: "example.local".into(),
            protocol_version: 765,
            username: "alice".into(),
            handshake_packet: handshake.encode().encode(),
            read_ahead: Packet::new(LOGIN_START_ID, login_data).encode(),
        }
    }

    fn status_request() -> RequestData {
        let handshake = Handshake {
            protocol_version: 765,
            server_address: "example.local".into(),
            server_port: 25565,
            next_state: NEXT_STATE_STATUS,
        };
        RequestData {
            kind: RequestKind::Status,
            username: String::new(),
            handshake_packet: handshake.encode().encode(),
            read_ahead: crate::spectral::protocol::status_request_packet().encode(),
            ..login_request()
        }
    }

    async fn decide(cfg: BackendConfig, req: RequestData) -> Action {
        let inbox = BackendAgent::spawn(cfg);
        let (tx, rx) = oneshot::channel();
        inbox
            .send(BackendRequest { data: req, reply: tx })
            .await
            .expect("send");
        rx.await.expect("reply")
    }

    #[tokio::test]
    async fn offline_login_gets_disconnect_packet() {
        let mut cfg = base_config();
        cfg.state_option = StateOption::AlwaysOffline;
        let expected = cfg.disconnect_packet.clone();

        match decide(cfg, login_request()).await {
            Action::Disconnect { packet } => assert_eq!(packet, expected),
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_status_gets_offline_packet() {
        let mut cfg = base_config();
        cfg.state_option = StateOption::AlwaysOffline;
        let expected = cfg.offline_status_packet.clone();

        match decide(cfg, status_request()).await {
            Action::SendStatus { packet } => assert_eq!(packet, expected),
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn online_login_re_emits_original_bytes() {
        let req = login_request();
        let handshake = req.handshake_packet.clone();
        let read_ahead = req.read_ahead.clone();

        match decide(base_config(), req).await {
            Action::Proxy {
                handshake: h,
                read_ahead: r,
                send_proxy_protocol,
                ..
            } => {
                assert_eq!(h, handshake, "handshake bytes must be untouched");
                assert_eq!(r, read_ahead);
                assert!(!send_proxy_protocol);
            }
            other => panic!("expected proxy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn online_status_without_cache_proxies() {
        let req = status_request();
        let read_ahead = req.read_ahead.clone();
        match decide(base_config(), req).await {
            Action::Proxy { read_ahead: r, .. } => assert_eq!(r, read_ahead),
            other => panic!("expected proxy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limited_login_gets_reconnect_packet() {
        let mut cfg = base_config();
        cfg.rate_limit = 1;
        cfg.limit_bots = false;
        let expected = cfg.rate_disconnect_packet.clone();

        let inbox = BackendAgent::spawn(cfg);
        for i in 0..2 {
            let (tx, rx) = oneshot::channel();
            inbox
                .send(BackendRequest {
                    data: login_request(),
                    reply: tx,
                })
                .await
                .expect("send");
            let action = rx.await.expect("reply");
            match (i, action) {
                (0, Action::Proxy { .. }) => {}
                (1, Action::Disconnect { packet }) => assert_eq!(packet, expected),
                (i, other) => panic!("request {i}: unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn rate_limited_status_closes() {
        let mut cfg = base_config();
        cfg.rate_limit = 1;
        cfg.limit_bots = false;
        cfg.rate_limit_status = true;

        let inbox = BackendAgent::spawn(cfg);
        let mut actions = Vec::new();
        for _ in 0..2 {
            let (tx, rx) = oneshot::channel();
            inbox
                .send(BackendRequest {
                    data: status_request(),
                    reply: tx,
                })
                .await
                .expect("send");
            actions.push(rx.await.expect("reply"));
        }
        assert!(matches!(actions[1], Action::Close));
    }

    #[tokio::test]
    async fn old_realip_rewrites_server_address() {
        let mut cfg = base_config();
        cfg.use_old_real_ip = true;

        match decide(cfg, login_request()).await {
            Action::Proxy { handshake, read_ahead, .. } => {
                let packet = decode_frame(&handshake).expect("frame");
                let decoded = Handshake::decode(&packet).expect("handshake");

                let parts: Vec<&str> = decoded.server_address.split(SEPARATOR).collect();
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[0], "example.local");
                assert_eq!(parts[1], "203.0.113.5");
                parts[2].parse::<u64>().expect("timestamp");

                // The login frame rides along unmodified.
                let login = decode_frame(&read_ahead).expect("frame");
                assert_eq!(decode_login_start(&login).expect("login"), "alice");
            }
            other => panic!("expected proxy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn new_realip_wins_over_old_and_signs() {
        let secret = p384::SecretKey::random(&mut rand::thread_rng());
        let verifying = RealIpSigner::new(&secret).verifying_key();

        let mut cfg = base_config();
        cfg.use_old_real_ip = true;
        cfg.use_new_real_ip = true;
        cfg.real_ip_key = Some(secret);

        match decide(cfg, login_request()).await {
            Action::Proxy { handshake, .. } => {
                let packet = decode_frame(&handshake).expect("frame");
                let decoded = Handshake::decode(&packet).expect("handshake");

                let parts: Vec<&str> = decoded.server_address.split(SEPARATOR).collect();
                assert_eq!(parts.len(), 4, "new realip token has four fields");

                use base64::Engine;
                use p384::ecdsa::signature::Verifier;
                let der = base64::engine::general_purpose::URL_SAFE
                    .decode(parts[3])
                    .expect("base64");
                let signature = p384::ecdsa::Signature::from_der(&der).expect("der");
                let message = format!("{}{}", parts[1], parts[2]);
                verifying
                    .verify(message.as_bytes(), &signature)
                    .expect("signature verifies");
            }
            other => panic!("expected proxy, got {other:?}"),
        }
    }

    #[test]
    fn bound_config_builds_an_agent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = crate::spectral::config::BackendFileConfig {
            name: "example".into(),
            domains: vec!["example.local".into()],
            proxy_to: "127.0.0.1:25600".into(),
            proxy_bind: None,
            dial_timeout: Duration::from_secs(1),
            use_old_real_ip: false,
            use_new_real_ip: true,
            real_ip_key_path: None,
            send_proxy_protocol: true,
            disconnect_message: r#"{"text": "Server is offline"}"#.into(),
            cache_status: true,
            cache_update_cooldown: Duration::from_secs(60),
            valid_protocol: 765,
            offline_status: SimpleStatus::default(),
            rate_limit: 5,
            rate_cooldown: Duration::from_secs(1),
            ban_list_cooldown: Duration::from_secs(300),
            unverify_cooldown: Duration::from_secs(600),
            limit_bots: true,
            rate_limit_status: false,
            reconnect_msg: r#"{"text": "Please reconnect to verify yourself"}"#.into(),
            check_state_option: String::new(),
            state_update_cooldown: Duration::from_secs(5),
        };
        let bound = file.bind(dir.path()).expect("bind");
        let agent = BackendAgent::new(bound);
        assert!(agent.real_ip_signer.is_some());
        assert!(agent.status.is_some());
        assert!(matches!(agent.limiter, ConnectionLimiter::BotFilter(_)));
    }
}
