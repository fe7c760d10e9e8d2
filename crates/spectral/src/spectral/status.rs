use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time;

use crate::spectral::net::Dialer;
use crate::spectral::protocol::{
    self, read_packet, read_packet_raw, status_request_packet, write_packet, CodecError,
    Handshake, NEXT_STATE_STATUS, STATUS_RESPONSE_ID,
};
use crate::spectral::proxyproto;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status exchange timed out")]
    Timeout,
    #[error("no cached status and the last refresh failed")]
    Unavailable,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-backend status cache.
///
/// Refresh attempts are gated by the cooldown: within a window at most one
/// status exchange reaches the backend no matter how many requests arrive.
/// A failed refresh keeps serving the previous packet when one exists and
/// leaves the cache otherwise untouched.
#[derive(Debug)]
pub struct StatusCache {
    valid_protocol: i32,
    cooldown: Duration,
    handshake_host: String,
    handshake_port: u16,
    send_proxy_protocol: bool,
    io_timeout: Duration,
    cached: Option<Vec<u8>>,
    last_attempt: Option<Instant>,
}

impl StatusCache {
    pub fn new(
        valid_protocol: i32,
        cooldown: Duration,
        handshake_host: String,
        handshake_port: u16,
        send_proxy_protocol: bool,
        io_timeout: Duration,
    ) -> Self {
        Self {
            valid_protocol,
            cooldown,
            handshake_host,
            handshake_port,
            send_proxy_protocol,
            io_timeout,
            cached: None,
            last_attempt: None,
        }
    }

    /// The cached packet, only while the entry is fresh.
    pub fn fresh(&self) -> Option<Vec<u8>> {
        let at = self.last_attempt?;
        if at.elapsed() < self.cooldown {
            self.cached.clone()
        } else {
            None
        }
    }

    pub async fn status(&mut self, dialer: &Dialer) -> Result<Vec<u8>, StatusError> {
        if let Some(at) = self.last_attempt {
            if at.elapsed() < self.cooldown {
                return self.cached.clone().ok_or(StatusError::Unavailable);
            }
        }

        self.last_attempt = Some(Instant::now());
        match self.refresh(dialer).await {
            Ok(packet) => {
                self.cached = Some(packet.clone());
                Ok(packet)
            }
            // Serve stale on refresh failure; the cache itself is untouched.
            Err(err) => self.cached.clone().ok_or(err),
        }
    }

    async fn refresh(&self, dialer: &Dialer) -> Result<Vec<u8>, StatusError> {
        let mut conn = dialer.dial().await?;

        if self.send_proxy_protocol {
            let header = proxyproto::encode_header(conn.local_addr()?, conn.peer_addr()?)?;
            conn.write_all(&header).await?;
        }

        let exchange = fetch_status(
            &mut conn,
            self.valid_protocol,
            &self.handshake_host,
            self.handshake_port,
        );
        match time::timeout(self.io_timeout, exchange).await {
            Ok(res) => res,
            Err(_) => Err(StatusError::Timeout),
        }
    }
}

/// The full server-list exchange: Handshake, StatusRequest, StatusResponse
/// (retained raw), then a throwaway Ping round. Failures after the response
/// is in hand are ignored.
pub async fn fetch_status<S>(
    conn: &mut S,
    protocol_version: i32,
    host: &str,
    port: u16,
) -> Result<Vec<u8>, StatusError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = Handshake {
        protocol_version,
        server_address: host.to_string(),
        server_port: port,
        next_state: NEXT_STATE_STATUS,
    };
    write_packet(conn, &handshake.encode()).await?;
    write_packet(conn, &status_request_packet()).await?;

    let (packet, raw) = read_packet_raw(conn).await?;
    if packet.id != STATUS_RESPONSE_ID {
        return Err(CodecError::UnexpectedPacket {
            got: packet.id,
            want: STATUS_RESPONSE_ID,
        }
        .into());
    }

    if write_packet(conn, &protocol::ping_packet(0)).await.is_ok() {
        let _ = read_packet(conn).await;
    }

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::protocol::SimpleStatus;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tokio::net::TcpListener;

    fn backend_status() -> Vec<u8> {
        SimpleStatus {
            name: "backend".into(),
            protocol: 755,
            description: "some random motd text".into(),
        }
        .marshal()
        .encode()
    }

    /// Backend that serves the status exchange, optionally hanging up after
    /// `close_by_step` protocol steps (mirrors the upstream failure table).
    async fn simulated_backend(close_by_step: usize) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = async {
                    if close_by_step == 1 {
                        return Ok::<(), StatusError>(());
                    }
                    read_packet(&mut conn).await?; // handshake
                    if close_by_step == 2 {
                        return Ok(());
                    }
                    read_packet(&mut conn).await?; // status request
                    if close_by_step == 3 {
                        return Ok(());
                    }
                    let response = backend_status();
                    conn.write_all(&response).await?;
                    if close_by_step == 4 {
                        return Ok(());
                    }
                    let ping = read_packet(&mut conn).await?;
                    if close_by_step == 5 {
                        return Ok(());
                    }
                    write_packet(&mut conn, &ping).await?;
                    Ok(())
                }
                .await;
            }
        });

        (addr, calls)
    }

    fn cache(cooldown: Duration) -> StatusCache {
        StatusCache::new(
            755,
            cooldown,
            "example.local".into(),
            25600,
            false,
            Duration::from_millis(500),
        )
    }

    fn dialer(addr: &str) -> Dialer {
        Dialer::new(addr, None, Duration::from_millis(250))
    }

    #[tokio::test]
    async fn normal_flow_returns_backend_packet() {
        let (addr, calls) = simulated_backend(0).await;
        let mut cache = cache(Duration::from_secs(60));

        let packet = cache.status(&dialer(&addr)).await.expect("status");
        assert_eq!(packet, backend_status());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cooldown_suppresses_refreshes() {
        let (addr, calls) = simulated_backend(0).await;
        let mut cache = cache(Duration::from_secs(60));
        let dialer = dialer(&addr);

        let first = cache.status(&dialer).await.expect("status");
        let second = cache.status(&dialer).await.expect("status");
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_cooldown_refreshes_once() {
        let (addr, calls) = simulated_backend(0).await;
        let mut cache = cache(Duration::from_millis(10));
        let dialer = dialer(&addr);

        cache.status(&dialer).await.expect("status");
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.status(&dialer).await.expect("status");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let mut cache = cache(Duration::from_secs(60));
        assert!(cache.status(&dialer(&addr)).await.is_err());
    }

    #[tokio::test]
    async fn early_close_fails_late_close_succeeds() {
        // Steps 1-3 abort before the response: error. Steps 4-5 close during
        // the ping round: the response is already in hand.
        for step in 1..=3 {
            let (addr, _) = simulated_backend(step).await;
            let mut cache = cache(Duration::from_secs(60));
            assert!(
                cache.status(&dialer(&addr)).await.is_err(),
                "close at step {step}"
            );
        }
        for step in 4..=5 {
            let (addr, _) = simulated_backend(step).await;
            let mut cache = cache(Duration::from_secs(60));
            let packet = cache.status(&dialer(&addr)).await.expect("status");
            assert_eq!(packet, backend_status(), "close at step {step}");
        }
    }

    #[tokio::test]
    async fn stale_entry_is_served_when_refresh_fails() {
        let (addr, _) = simulated_backend(0).await;
        let mut cache = cache(Duration::from_millis(10));
        let good = dialer(&addr);

        let packet = cache.status(&good).await.expect("status");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Backend gone: the stale packet is still served.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let dead = dialer(&listener.local_addr().expect("addr").to_string());
        drop(listener);

        let stale = cache.status(&dead).await.expect("stale");
        assert_eq!(stale, packet);
    }

    #[tokio::test]
    async fn fetch_status_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            read_packet(&mut server).await.expect("handshake");
            read_packet(&mut server).await.expect("status request");
            server.write_all(&backend_status()).await.expect("response");
            let ping = read_packet(&mut server).await.expect("ping");
            write_packet(&mut server, &ping).await.expect("pong");
        });

        let raw = fetch_status(&mut client, 755, "example.local", 25600)
            .await
            .expect("fetch");
        assert_eq!(raw, backend_status());
        server_task.await.expect("server");
    }
}
