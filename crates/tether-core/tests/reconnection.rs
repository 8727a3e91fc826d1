//! Reconnecting client and server over real sockets.

mod common;

use common::{eventually, simple_service, Observed, SimpleClient};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    CancellationToken, LinkState, ReconnectConfig, ReconnectingClient, ReconnectingServer,
    RpcError, TcpAcceptor, TcpConnector,
};

async fn tcp_pair(observed: Arc<Observed>) -> (ReconnectingServer, ReconnectingClient) {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
    let addr = acceptor.local_addr().unwrap();
    let server = ReconnectingServer::builder(acceptor, simple_service(observed))
        .config(ReconnectConfig::local())
        .start();
    let client = ReconnectingClient::builder(TcpConnector::new(addr.to_string()))
        .config(ReconnectConfig::local())
        .start();
    (server, client)
}

#[tokio::test]
async fn test_calls_resume_after_server_drops_peer() {
    let observed = Arc::new(Observed::default());
    let (server, client) = tcp_pair(observed.clone()).await;
    client.wait_connected().await.unwrap();

    let simple = SimpleClient::new(client.registry());
    assert_eq!(simple.sqrt(4.0).await.unwrap(), 2.0);

    server.session().unwrap().dispose();
    eventually(|| client.generation() == 2 && client.state() == LinkState::Connected).await;

    assert_eq!(simple.sqrt(0.0).await.unwrap(), 0.0);
    assert!(simple.sqrt(-10.0).await.unwrap().is_nan());
    assert_eq!(server.generation(), 2);
}

#[tokio::test]
async fn test_pending_call_is_replayed_and_resolved_once() {
    let observed = Arc::new(Observed::default());
    let (server, client) = tcp_pair(observed.clone()).await;
    let client = Arc::new(client);
    client.wait_connected().await.unwrap();

    let cancel = CancellationToken::new();
    let caller = client.clone();
    let call_cancel = cancel.clone();
    let call = tokio::spawn(async move {
        SimpleClient::new(caller.registry())
            .indefinite(&call_cancel)
            .await
    });
    eventually(|| observed.started() == 1).await;

    // The first server side is torn down with the handler still running
    server.session().unwrap().dispose();
    eventually(|| observed.started() == 2).await;
    assert_eq!(client.generation(), 2);
    assert_eq!(client.registry().pending_count(), 1);
    assert!(!call.is_finished());

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(RpcError::Cancelled)));
    assert_eq!(client.registry().pending_count(), 0);

    // Both runs of the handler end cancelled: the first by the dropped
    // session, the replayed one by the caller
    eventually(|| observed.cancelled() == 2).await;
    let session = server.session().unwrap();
    let dispatcher = session.dispatcher().unwrap().clone();
    eventually(|| dispatcher.in_flight_count() == 0).await;
}

#[tokio::test]
async fn test_client_dispose_stops_reconnecting() {
    let observed = Arc::new(Observed::default());
    let (server, client) = tcp_pair(observed).await;
    client.wait_connected().await.unwrap();
    let mut states = client.watch_state();

    client.dispose();
    assert!(client.is_disposed());
    states
        .wait_for(|state| *state == LinkState::Disposed)
        .await
        .unwrap();

    let err = SimpleClient::new(client.registry())
        .sqrt(1.0)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Disposed));

    eventually(|| server.state() != LinkState::Connected).await;
    assert_eq!(client.generation(), 1);
}
