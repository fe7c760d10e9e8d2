use std::{borrow::Cow, io, net::SocketAddr, time::Duration};

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time;

/// Normalize a bind/listen address.
///
/// Config commonly uses the shorthand `":PORT"` to mean "bind on all
/// interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not accept
/// `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Split `host:port` into its parts; a missing port falls back to the default
/// Minecraft port. IPv6 bracket notation is honored.
pub fn split_host_port(addr: &str) -> (String, u16) {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(25565);
            return (host.to_string(), port);
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse().unwrap_or(25565);
            (host.to_string(), port)
        }
        _ => (addr.to_string(), 25565),
    }
}

/// Capability to open a TCP connection to one backend.
///
/// Carried inside `Action::Proxy` so the worker, not the agent, opens the
/// proxied connection.
#[derive(Debug, Clone)]
pub struct Dialer {
    pub addr: String,
    pub bind: Option<String>,
    pub timeout: Duration,
}

impl Dialer {
    pub fn new(addr: impl Into<String>, bind: Option<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            bind,
            timeout,
        }
    }

    pub async fn dial(&self) -> io::Result<TcpStream> {
        match time::timeout(self.timeout, self.connect()).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial {} timed out", self.addr),
            )),
        }
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host(self.addr.as_str()).await? {
            match self.connect_one(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", self.addr),
            )
        }))
    }

    async fn connect_one(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let Some(bind) = &self.bind else {
            return TcpStream::connect(addr).await;
        };

        let bind_ip: std::net::IpAddr = bind
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bind {bind}: {e}")))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(bind_ip, 0))?;
        socket.connect(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":25565").as_ref(), "0.0.0.0:25565");
        assert_eq!(normalize_bind_addr(" :9100 ").as_ref(), "0.0.0.0:9100");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:25565").as_ref(),
            "127.0.0.1:25565"
        );
        assert_eq!(normalize_bind_addr("[::]:25565").as_ref(), "[::]:25565");
    }

    #[test]
    fn split_host_port_variants() {
        assert_eq!(
            split_host_port("example.local:25600"),
            ("example.local".into(), 25600)
        );
        assert_eq!(split_host_port("example.local"), ("example.local".into(), 25565));
        assert_eq!(split_host_port("[::1]:25600"), ("::1".into(), 25600));
        assert_eq!(split_host_port("[::1]"), ("::1".into(), 25565));
    }

    #[tokio::test]
    async fn dial_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let dialer = Dialer::new(addr.to_string(), None, Duration::from_secs(1));
        let stream = dialer.dial().await.expect("dial");
        assert_eq!(stream.peer_addr().expect("peer"), addr);
    }

    #[tokio::test]
    async fn dial_honors_local_bind() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let dialer = Dialer::new(
            addr.to_string(),
            Some("127.0.0.1".into()),
            Duration::from_secs(1),
        );
        let stream = dialer.dial().await.expect("dial");
        assert_eq!(
            stream.local_addr().expect("local").ip(),
            "127.0.0.1".parse::<std::net::IpAddr>().expect("ip")
        );
    }
}
