use std::{
    io,
    net::{SocketAddr, SocketAddrV6},
};

use bytes::BytesMut;
use proxy_protocol::{version2, ProxyHeader};
use tokio::io::{AsyncRead, AsyncReadExt};

/// The 12-byte PROXY-protocol v2 signature.
pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Encode a v2 PROXY header. For proxied client connections the source is the
/// true client address and the destination the proxy's local address on the
/// backend connection; synthetic exchanges (status refresh) announce the
/// proxy itself as the source.
///
/// Mixed address families are carried as a TCP6 block with the IPv4 side
/// v6-mapped.
pub fn encode_header(source: SocketAddr, destination: SocketAddr) -> io::Result<Vec<u8>> {
    let addresses = match (source, destination) {
        (SocketAddr::V4(source), SocketAddr::V4(destination)) => version2::ProxyAddresses::Ipv4 {
            source,
            destination,
        },
        (source, destination) => version2::ProxyAddresses::Ipv6 {
            source: to_v6(source),
            destination: to_v6(destination),
        },
    };

    proxy_protocol::encode(ProxyHeader::Version2 {
        command: version2::ProxyCommand::Proxy,
        transport_protocol: version2::ProxyTransportProtocol::Stream,
        addresses,
    })
    .map(|b| b.to_vec())
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn to_v6(addr: SocketAddr) -> SocketAddrV6 {
    match addr {
        SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0),
        SocketAddr::V6(v6) => v6,
    }
}

/// Read and validate an inbound v2 header, returning the advertised source
/// address. `None` means a LOCAL command: keep the observed peer address.
pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<SocketAddr>> {
    let mut head = [0u8; 16];
    r.read_exact(&mut head).await?;
    if head[..12] != SIGNATURE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing proxy protocol v2 signature",
        ));
    }

    let len = u16::from_be_bytes([head[14], head[15]]) as usize;
    let mut buf = BytesMut::with_capacity(16 + len);
    buf.extend_from_slice(&head);
    buf.resize(16 + len, 0);
    r.read_exact(&mut buf[16..]).await?;

    let mut buf = buf.freeze();
    let header = proxy_protocol::parse(&mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    match header {
        ProxyHeader::Version2 {
            command: version2::ProxyCommand::Local,
            ..
        } => Ok(None),
        ProxyHeader::Version2 { addresses, .. } => match addresses {
            version2::ProxyAddresses::Ipv4 { source, .. } => Ok(Some(SocketAddr::V4(source))),
            version2::ProxyAddresses::Ipv6 { source, .. } => Ok(Some(SocketAddr::V6(source))),
            version2::ProxyAddresses::Unspec => Ok(None),
            version2::ProxyAddresses::Unix { .. } => Ok(None),
        },
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported proxy protocol version",
        )),
    }
}
