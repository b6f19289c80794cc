use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;
use crate::registry::{ConnectionRegistry, PushSink};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// Write half of an accepted WebSocket connection.
pub struct WsSink {
    user_id: String,
    writer: Mutex<WsWriter>,
    send_timeout: Duration,
}

impl WsSink {
    fn new(user_id: &str, writer: WsWriter) -> Self {
        Self {
            user_id: user_id.to_string(),
            writer: Mutex::new(writer),
            send_timeout: SEND_TIMEOUT,
        }
    }
}

impl PushSink for WsSink {
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<(), Report<DeliveryError>>> {
        Box::pin(async move {
            let transport = || {
                Report::new(DeliveryError::Transport {
                    user_id: self.user_id.clone(),
                })
            };

            // Bounded so one stalled peer cannot hold up an evaluation batch.
            let write = async { self.writer.lock().await.send(Message::text(text)).await };
            match tokio::time::timeout(self.send_timeout, write).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(transport().attach(e.to_string())),
                Err(_) => Err(transport().attach(format!(
                    "write timed out after {:?}",
                    self.send_timeout
                ))),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Errors here mean the peer is already gone.
            let _ = self.writer.lock().await.close().await;
        })
    }
}

/// Accept push connections until `cancel` fires.
///
/// Clients connect to `ws://<bind_addr>/?user_id=<id>`.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "push server listening");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let registry = Arc::clone(&registry);
        let cancel = cancel.clone();
        tracker.spawn(async move {
            debug!(%peer, "incoming connection");
            handle_connection(stream, registry, cancel).await;
        });
    }

    info!("push server stopped accepting connections");
}

/// Tell every client the server is going away, then stop the read loops and
/// close all connections. Returns how many clients got the notice.
///
/// Read loops close their sockets on cancel, so the notice goes out first.
pub async fn shut_down(registry: &ConnectionRegistry, cancel: &CancellationToken) -> usize {
    let notified = registry
        .broadcast(&serde_json::json!({ "type": "shutdown" }))
        .await;
    cancel.cancel();
    registry.close_all().await;
    notified
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) {
    let mut user_id = None;
    let callback = |request: &Request, response: Response| {
        match user_id_from_query(request.uri().query()) {
            Some(id) => {
                user_id = Some(id);
                Ok(response)
            }
            None => Err(bad_request("missing user_id query parameter")),
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "websocket handshake rejected");
            return;
        }
    };
    let Some(user_id) = user_id else {
        return;
    };

    let (writer, reader) = ws.split();
    let sink = Arc::new(WsSink::new(&user_id, writer));
    let connection_id = registry.register(&user_id, sink.clone()).await;

    read_loop(reader, &sink, &cancel).await;

    if registry.release(&user_id, connection_id) {
        info!(user_id = %user_id, connection = %connection_id, "push connection closed");
    }
    sink.close().await;
}

/// Inbound frames only signal liveness; the loop ends on close, error or shutdown.
async fn read_loop(mut reader: WsReader, sink: &WsSink, cancel: &CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(Message::Ping(payload))) => {
                if sink.writer.lock().await.send(Message::Pong(payload)).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(user_id = %sink.user_id, error = %e, "websocket read failed");
                return;
            }
        }
    }
}

fn user_id_from_query(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "user_id")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    #[test]
    fn user_id_parsed_from_query() {
        assert_eq!(user_id_from_query(Some("user_id=u-1")), Some("u-1".into()));
        assert_eq!(
            user_id_from_query(Some("token=abc&user_id=u-2")),
            Some("u-2".into())
        );
        assert_eq!(user_id_from_query(Some("user_id=")), None);
        assert_eq!(user_id_from_query(Some("other=1")), None);
        assert_eq!(user_id_from_query(None), None);
    }

    #[test]
    fn user_id_is_percent_decoded() {
        assert_eq!(user_id_from_query(Some("user_id=a%40b")), Some("a@b".into()));
        assert_eq!(
            user_id_from_query(Some("user_id=jane+doe")),
            Some("jane doe".into())
        );
    }

    #[tokio::test]
    async fn stalled_write_times_out_as_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        let (_client, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        let (writer, _reader) = accept.await.unwrap().split();

        let mut sink = WsSink::new("u-1", writer);
        sink.send_timeout = Duration::from_millis(50);

        // Holding the writer keeps the send from ever starting.
        let guard = sink.writer.lock().await;
        let err = sink.send_text("{}".into()).await.unwrap_err();
        drop(guard);
        assert!(matches!(
            err.current_context(),
            DeliveryError::Transport { .. }
        ));

        sink.send_text("{}".into()).await.unwrap();
    }

    #[test]
    fn bad_request_status() {
        assert_eq!(bad_request("x").status(), StatusCode::BAD_REQUEST);
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn client_receives_pushed_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let server = tokio::spawn(serve(
            listener,
            Arc::clone(&registry),
            cancel.clone(),
            tracker.clone(),
        ));

        let (mut client, _) = connect_async(format!("ws://{addr}/?user_id=u-1"))
            .await
            .unwrap();
        wait_for(|| registry.is_connected("u-1")).await;

        registry
            .send("u-1", &serde_json::json!({"current_price": 165.0}))
            .await
            .unwrap();
        let frame = client.next().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["current_price"], 165.0);

        client.close(None).await.unwrap();
        wait_for(|| !registry.is_connected("u-1")).await;

        cancel.cancel();
        server.await.unwrap();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn shutdown_notice_arrives_before_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let server = tokio::spawn(serve(
            listener,
            Arc::clone(&registry),
            cancel.clone(),
            tracker.clone(),
        ));

        let (mut client, _) = connect_async(format!("ws://{addr}/?user_id=u-1"))
            .await
            .unwrap();
        wait_for(|| registry.is_connected("u-1")).await;

        assert_eq!(shut_down(&registry, &cancel).await, 1);
        assert!(registry.is_empty());

        let frame = client.next().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "shutdown");

        server.await.unwrap();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn handshake_without_user_id_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            Arc::clone(&registry),
            cancel.clone(),
            TaskTracker::new(),
        ));

        let result = connect_async(format!("ws://{addr}/")).await;
        assert!(result.is_err());
        assert!(registry.is_empty());

        cancel.cancel();
        server.await.unwrap();
    }
}
