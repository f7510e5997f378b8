use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use lib_tokenwise::core::{SubscriberId, encode_frame};
use lib_tokenwise::Store;
use lib_tokenwise::model::TransactionFilter;

use crate::tokenwise_logic::api;
use crate::tokenwise_logic::model::{ClientMessage, GREETING, ServerMessage};
use crate::tokenwise_logic::state::AppState;

/// Time given to open connections once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws/transactions", get(ws_handler))
        .nest("/api", api::routes())
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub async fn run(app_state: AppState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let settings = app_state.settings().clone();
    let app = router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    if let Some(tls) = settings.tls {
        let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key).await?;
        let handle = axum_server::Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown.recv().await.ok();
                info!("Downstream server shutting down.");
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            }
        });
        info!("Downstream server listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Downstream server listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.recv().await.ok();
                info!("Downstream server shutting down.");
            })
            .await?;
    }
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    run_session(state, sink, stream).await;
}

/// One task per client. Outbound frames arrive through the registry queue, so
/// this task is the only writer to the socket.
async fn run_session<W, R, E>(state: AppState, mut sink: W, mut stream: R)
where
    W: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let registry = state.registry().clone();
    let (client_id, mut outbound) = registry.connect();

    reply(
        &state,
        client_id,
        &ServerMessage::ConnectionEstablished {
            message: GREETING,
            monitoring_token: state.token().to_string(),
            tracked_wallets: state.tracked().len(),
            timestamp: Utc::now(),
        },
    );

    let idle_timeout = state.settings().idle_timeout;
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Text(frame.as_ref().into())).await.is_err() {
                        break; // client disconnected
                    }
                }
                // Dropped by the registry.
                None => break,
            },
            incoming = stream.next() => {
                idle.as_mut().reset(Instant::now() + idle_timeout);
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_command(&state, client_id, text.as_str()).await,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = &mut idle => {
                idle.as_mut().reset(Instant::now() + idle_timeout);
                reply(&state, client_id, &ServerMessage::Keepalive { timestamp: Utc::now() });
            }
        }
    }

    registry.disconnect(client_id);
}

async fn handle_command(state: &AppState, client_id: SubscriberId, text: &str) {
    let command = match serde_json::from_str::<ClientMessage>(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(subscriber = %client_id, error = %e, "Ignoring client message");
            return;
        }
    };

    let response = match command {
        ClientMessage::Ping => ServerMessage::Pong { timestamp: Utc::now() },
        ClientMessage::GetStatus => ServerMessage::Status {
            monitoring_active: state.monitor().is_running(),
            connected_clients: state.registry().len(),
            tracked_wallets: state.tracked().len(),
            timestamp: Utc::now(),
        },
        ClientMessage::GetRecentTransactions { limit } => {
            let limit = ClientMessage::recent_limit(limit);
            match state.store().recent_transactions(&TransactionFilter::default(), limit).await {
                Ok(transactions) => ServerMessage::RecentTransactions {
                    transactions,
                    timestamp: Utc::now(),
                },
                Err(e) => {
                    warn!(subscriber = %client_id, error = %e, "Failed to load recent transactions");
                    return;
                }
            }
        }
    };
    reply(state, client_id, &response);
}

fn reply(state: &AppState, client_id: SubscriberId, message: &ServerMessage) {
    match encode_frame(message) {
        Ok(frame) => {
            if state.registry().send(client_id, frame).is_err() {
                debug!(subscriber = %client_id, "Reply to departed client dropped");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode server message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{sink, stream};
    use lib_tokenwise::MemoryStore;
    use lib_tokenwise::model::{ActionKind, TransactionEvent};
    use serde_json::Value;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use crate::tokenwise_logic::state::testing::app;

    /// A session wired to channels: `client` feeds it messages, `frames` receives
    /// what it writes to the socket.
    struct Session {
        client: mpsc::UnboundedSender<Message>,
        frames: mpsc::UnboundedReceiver<Value>,
        task: JoinHandle<()>,
    }

    fn open(state: AppState) -> Session {
        let (client, inbox) = mpsc::unbounded_channel::<Message>();
        let (written, frames) = mpsc::unbounded_channel::<Value>();

        let incoming = stream::unfold(inbox, |mut inbox| async move {
            inbox.recv().await.map(|message| (Ok::<_, Infallible>(message), inbox))
        });
        let outgoing = sink::unfold(written, |written, message: Message| async move {
            if let Message::Text(text) = message {
                let value = serde_json::from_str(text.as_str()).map_err(|_| ())?;
                written.send(value).map_err(|_| ())?;
            }
            Ok::<_, ()>(written)
        });

        let task = tokio::spawn(run_session(state, Box::pin(outgoing), Box::pin(incoming)));
        Session { client, frames, task }
    }

    impl Session {
        fn say(&self, text: &str) {
            self.client.send(Message::Text(text.into())).unwrap();
        }

        async fn next(&mut self) -> Value {
            self.frames.recv().await.unwrap()
        }
    }

    fn event(signature: &str) -> TransactionEvent {
        let timestamp = Utc::now();
        TransactionEvent {
            signature: signature.to_string(),
            timestamp,
            wallet: "w1".to_string(),
            token_address: "mint".to_string(),
            amount: 42.0,
            action_type: ActionKind::Sell,
            protocol: "Raydium".to_string(),
            block_time: timestamp.timestamp(),
            slot: 9,
            from_address: None,
            to_address: None,
            pre_balance: None,
            post_balance: None,
        }
    }

    #[tokio::test]
    async fn greets_then_answers_commands() {
        let store = Arc::new(MemoryStore::new());
        store.insert_transaction(&event("s1")).await.unwrap();
        store.insert_transaction(&event("s2")).await.unwrap();
        let state = app(store);
        let mut session = open(state.clone());

        let greeting = session.next().await;
        assert_eq!(greeting["type"], "connection_established");
        assert_eq!(greeting["message"], GREETING);
        assert_eq!(greeting["monitoring_token"], "mint");

        session.say(r#"{"command":"ping"}"#);
        assert_eq!(session.next().await["type"], "pong");

        session.say(r#"{"command":"get_status"}"#);
        let status = session.next().await;
        assert_eq!(status["type"], "status");
        assert_eq!(status["connected_clients"], 1);
        assert_eq!(status["monitoring_active"], false);

        session.say(r#"{"command":"get_recent_transactions","limit":1}"#);
        let recent = session.next().await;
        assert_eq!(recent["type"], "recent_transactions");
        assert_eq!(recent["transactions"].as_array().unwrap().len(), 1);
        assert_eq!(recent["transactions"][0]["signature"], "s2");
    }

    #[tokio::test]
    async fn unknown_and_malformed_messages_are_ignored() {
        let mut session = open(app(Arc::new(MemoryStore::new())));
        assert_eq!(session.next().await["type"], "connection_established");

        session.say(r#"{"command":"get_dashboard"}"#);
        session.say("not json");
        session.say(r#"{"command":"ping"}"#);

        // The ping is the next thing written; nothing was sent for the others.
        assert_eq!(session.next().await["type"], "pong");
        assert!(session.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_frames_reach_the_socket() {
        let state = app(Arc::new(MemoryStore::new()));
        let mut session = open(state.clone());
        assert_eq!(session.next().await["type"], "connection_established");

        let frame = encode_frame(&serde_json::json!({"type": "dashboard_update", "holder_count": 0})).unwrap();
        assert_eq!(state.registry().broadcast(frame).delivered, 1);
        assert_eq!(session.next().await["type"], "dashboard_update");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_client_gets_keepalive() {
        let state = app(Arc::new(MemoryStore::new()));
        let idle = state.settings().idle_timeout;
        let mut session = open(state);
        assert_eq!(session.next().await["type"], "connection_established");

        // Client traffic pushes the deadline out.
        tokio::time::sleep(idle - Duration::from_secs(1)).await;
        session.say(r#"{"command":"ping"}"#);
        assert_eq!(session.next().await["type"], "pong");
        let sent_at = Instant::now();

        assert_eq!(session.next().await["type"], "keepalive");
        assert!(sent_at.elapsed() >= idle - Duration::from_millis(1));

        // And again after another idle period.
        assert_eq!(session.next().await["type"], "keepalive");
    }

    #[tokio::test]
    async fn closing_the_socket_unregisters_the_client() {
        let state = app(Arc::new(MemoryStore::new()));
        let mut session = open(state.clone());
        assert_eq!(session.next().await["type"], "connection_established");
        assert_eq!(state.registry().len(), 1);

        session.client.send(Message::Close(None)).unwrap();
        session.task.await.unwrap();
        assert_eq!(state.registry().len(), 0);
    }

    #[tokio::test]
    async fn dropped_stream_unregisters_the_client() {
        let state = app(Arc::new(MemoryStore::new()));
        let Session { client, mut frames, task } = open(state.clone());
        assert_eq!(frames.recv().await.unwrap()["type"], "connection_established");

        drop(client);
        task.await.unwrap();
        assert!(state.registry().is_empty());
    }
}
