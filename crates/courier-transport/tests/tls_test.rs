//! Delivery over real TCP and TLS on the loopback interface.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ack, lines, read_exchange};
use courier_transport::tls::{
    generate_self_signed_ca, generate_signed_cert, TlsAcceptor, TlsConnector,
};
use courier_transport::{
    Batch, Dialer, LineEvent, TlsDialer, TransportConfig, WorkerExit, WorkerPool,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

struct Pki {
    ca_cert: Vec<u8>,
    server: (Vec<u8>, Vec<u8>),
    client: (Vec<u8>, Vec<u8>),
}

fn pki() -> Pki {
    let (ca_cert, ca_key) = generate_self_signed_ca().unwrap();
    let server = generate_signed_cert(&ca_cert, &ca_key, "localhost").unwrap();
    let client = generate_signed_cert(&ca_cert, &ca_key, "shipper-1").unwrap();
    Pki {
        ca_cert,
        server,
        client,
    }
}

/// Accepts TLS connections and acknowledges every batch.
async fn collector(acceptor: TlsAcceptor) -> (String, mpsc::UnboundedReceiver<u32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("localhost:{}", listener.local_addr().unwrap().port());
    let acceptor = Arc::new(acceptor);
    let (windows_tx, windows_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let windows = windows_tx.clone();
            tokio::spawn(async move {
                let Ok(mut stream) = acceptor.accept(tcp).await else {
                    return;
                };
                while let Ok(received) = read_exchange(&mut stream).await {
                    let _ = windows.send(received.window);
                    ack(&mut stream, received.window).await;
                }
            });
        }
    });

    (addr, windows_rx)
}

#[tokio::test]
async fn test_mutual_tls_delivery() {
    let pki = pki();
    let acceptor =
        TlsAcceptor::new(&pki.server.0, &pki.server.1, Some(pki.ca_cert.as_slice())).unwrap();
    let (addr, mut windows) = collector(acceptor).await;

    let tls = TlsConnector::from_pem(
        Some(pki.ca_cert.as_slice()),
        Some((pki.client.0.as_slice(), pki.client.1.as_slice())),
    ).unwrap();
    let config = TransportConfig {
        timeout_secs: 5,
        ..TransportConfig::new(vec![addr])
    };
    let mut pool = WorkerPool::new(config, Arc::new(TlsDialer::new(tls))).unwrap();
    let (input_tx, input_rx) = mpsc::channel(4);
    let (acked_tx, mut acked_rx) = mpsc::channel::<Batch<LineEvent>>(4);
    pool.spawn(1, input_rx, acked_tx).unwrap();

    input_tx.send(lines("app.log", &["hello", "world"])).await.unwrap();
    input_tx.send(lines("app.log", &["again"])).await.unwrap();
    drop(input_tx);

    assert_eq!(acked_rx.recv().await.unwrap().len(), 2);
    assert_eq!(acked_rx.recv().await.unwrap().len(), 1);
    assert_eq!(windows.recv().await, Some(2));
    assert_eq!(windows.recv().await, Some(1));

    let exits = pool.join().await.unwrap();
    assert_eq!(exits[0].1, WorkerExit::Drained);
}

#[tokio::test]
async fn test_server_only_tls_delivery() {
    let pki = pki();
    let acceptor = TlsAcceptor::new(&pki.server.0, &pki.server.1, None).unwrap();
    let (addr, mut windows) = collector(acceptor).await;

    let tls = TlsConnector::from_pem(Some(pki.ca_cert.as_slice()), None).unwrap();
    let conn = TlsDialer::new(tls)
        .dial(&addr, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(conn.peer_addr(), addr);
    conn.close().await;
    assert!(windows.try_recv().is_err());
}

#[tokio::test]
async fn test_untrusted_collector_is_transient_failure() {
    let pki = pki();
    let acceptor = TlsAcceptor::new(&pki.server.0, &pki.server.1, None).unwrap();
    let (addr, _windows) = collector(acceptor).await;

    let (other_ca, _) = generate_self_signed_ca().unwrap();
    let tls = TlsConnector::from_pem(Some(other_ca.as_slice()), None).unwrap();
    let err = TlsDialer::new(tls)
        .dial(&addr, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err}");
}
