use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::spectral::worker::Inbound;

/// One accept loop: connections go into the bounded work queue consumed by
/// the workers. Several of these can share the same socket.
pub async fn serve(
    listener: Arc<TcpListener>,
    inbound: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, client_addr) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err = %err, "listener: accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                metrics::counter!("spectral_accepted_connections_total").increment(1);

                if inbound.send(Inbound { stream, client_addr }).await.is_err() {
                    // Worker pool is gone; stop accepting.
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepted_connections_reach_the_queue() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.expect("bind"));
        let addr = listener.local_addr().expect("addr");
        let (tx, mut rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(serve(listener, tx, shutdown_rx));

        let client = TcpStream::connect(addr).await.expect("connect");
        let inbound = rx.recv().await.expect("inbound");
        assert_eq!(inbound.client_addr, client.local_addr().expect("addr"));
    }

    #[tokio::test]
    async fn shutdown_stops_the_accept_loop() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.expect("bind"));
        let (tx, _rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(serve(listener, tx, shutdown_rx));
        shutdown_tx.send(true).expect("signal");
        handle.await.expect("join").expect("serve");
    }
}
