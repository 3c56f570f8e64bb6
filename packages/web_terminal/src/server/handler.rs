//! Per-connection WebSocket handler.
//!
//! Tasks per connection: the dispatch loop below (sequential, in arrival
//! order), one writer draining the outbound queue, a heartbeat ticker, and
//! once a session is bound an input forwarder, an output pump and an exit
//! watcher. The dispatch loop never waits on session input, so a process that
//! stops reading cannot stall resizes or teardown.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum_extra::extract::Query;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use session_driver::{Session, SessionError};
use terminal_protocol::{ConnectRequest, ExitNotification, Frame, ResizeRequest};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ServerConfig;
use crate::server::AppState;
use crate::server::connect::resolve_session;
use crate::server::connection::{
    Connection, ConnectionState, INPUT_QUEUE_DEPTH, OUTBOUND_QUEUE_DEPTH, Outbound,
};
use crate::server::query::ConnectQuery;

const OUTPUT_CHUNK_SIZE: usize = 8192;

pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let config = state.config.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, config, query))
}

pub(crate) async fn handle_connection(
    socket: WebSocket,
    config: Arc<ServerConfig>,
    query: ConnectQuery,
) {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let conn = Arc::new(Connection::new(tx));
    let span = info_span!("connection", conn_id = %conn.id);
    serve_connection(socket, conn, rx, config, query)
        .instrument(span)
        .await;
}

async fn serve_connection(
    socket: WebSocket,
    conn: Arc<Connection>,
    rx: mpsc::Receiver<Outbound>,
    config: Arc<ServerConfig>,
    query: ConnectQuery,
) {
    info!("websocket connected");
    let (ws_sender, mut ws_receiver) = socket.split();

    let writer = tokio::spawn(write_loop(ws_sender, rx, conn.cancel.clone()).in_current_span());
    let heartbeat = tokio::spawn(
        heartbeat_loop(conn.clone(), config.heartbeat_interval()).in_current_span(),
    );
    conn.set_state(ConnectionState::AwaitingConnect);

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = conn.cancel.cancelled() => break,
        };
        let bytes = match msg {
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Close(_))) | None => {
                debug!("peer closed connection");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                continue;
            }
        };

        if dispatch(&conn, frame, &config, &query).await.is_break() {
            break;
        }
    }

    teardown(&conn).await;
    heartbeat.abort();
    if let Err(e) = writer.await {
        debug!(error = %e, "writer task ended abnormally");
    }
    info!("websocket closed");
}

/// Handle one inbound frame
async fn dispatch(
    conn: &Arc<Connection>,
    frame: Frame,
    config: &Arc<ServerConfig>,
    query: &ConnectQuery,
) -> ControlFlow<()> {
    match frame {
        Frame::Connect(request) => {
            if conn.session().is_some() {
                warn!("session already bound, ignoring connect");
                return ControlFlow::Continue(());
            }
            handle_connect(conn, request, config, query).await
        }
        Frame::Key(data) => {
            let Some(bound) = conn.bound() else {
                warn!("key before connect, closing");
                return ControlFlow::Break(());
            };
            if bound.options.read_only {
                debug!(len = data.len(), "read-only session, dropping input");
                return ControlFlow::Continue(());
            }
            match bound.input.try_send(data) {
                Ok(()) => {}
                Err(TrySendError::Full(data)) => {
                    warn!(len = data.len(), "session is not reading input, dropping keys");
                }
                Err(TrySendError::Closed(_)) => debug!("input forwarder gone, dropping keys"),
            }
            ControlFlow::Continue(())
        }
        Frame::Resize(ResizeRequest { cols, rows }) => {
            let Some(session) = conn.session() else {
                warn!("resize before connect, closing");
                return ControlFlow::Break(());
            };
            if let Err(e) = session.resize(rows, cols).await {
                warn!(rows, cols, error = %e, "failed to resize session");
            }
            ControlFlow::Continue(())
        }
        Frame::HeartBeat(_) => {
            debug!("heartbeat from peer");
            ControlFlow::Continue(())
        }
        Frame::Unrecognized { type_byte, payload } => {
            warn!(type_byte, len = payload.len(), "unrecognized frame type");
            ControlFlow::Continue(())
        }
        other => {
            debug!(kind = ?other.message_type(), "ignoring frame");
            ControlFlow::Continue(())
        }
    }
}

async fn handle_connect(
    conn: &Arc<Connection>,
    request: ConnectRequest,
    config: &Arc<ServerConfig>,
    query: &ConnectQuery,
) -> ControlFlow<()> {
    let started = match resolve_session(&request, query, config) {
        Ok((session_config, options)) => Session::connect(session_config)
            .await
            .map(|session| (session, options)),
        Err(e) => Err(e),
    };

    let (session, options) = match started {
        Ok(started) => started,
        Err(e) => {
            warn!(error = %e, "failed to start session");
            conn.set_state(ConnectionState::Exiting);
            conn.send(Frame::Exit(ExitNotification {
                code: 1,
                message: format!("failed to connect: {e}"),
            }))
            .await;
            conn.send_close().await;
            return ControlFlow::Break(());
        }
    };

    let session = Arc::new(session);
    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
    conn.bind(session.clone(), options, input_tx);
    info!(
        driver = %session.driver(),
        read_only = options.read_only,
        wait_until_finished = options.wait_until_finished,
        "session bound"
    );

    // The ack must be queued before any output
    conn.send(Frame::Connect(ConnectRequest::default())).await;
    conn.set_state(ConnectionState::Streaming);

    tokio::spawn(forward_input(conn.clone(), session.clone(), input_rx).in_current_span());
    let pump = tokio::spawn(pump_output(conn.clone(), session.clone()).in_current_span());
    tokio::spawn(watch_exit(conn.clone(), session, pump, config.exit_grace()).in_current_span());
    ControlFlow::Continue(())
}

/// Write queued Key payloads to the session in arrival order
async fn forward_input(
    conn: Arc<Connection>,
    session: Arc<Session>,
    mut input: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        let data = tokio::select! {
            data = input.recv() => data,
            _ = conn.cancel.cancelled() => None,
        };
        let Some(data) = data else {
            break;
        };
        match session.write(&data).await {
            Ok(_) => {}
            Err(SessionError::Closed) => {
                debug!("session closed, input forwarder stopping");
                break;
            }
            Err(e) if session.has_exited() => debug!(error = %e, "write after session exit"),
            Err(e) => warn!(error = %e, "failed to write to session"),
        }
    }
    debug!("input forwarder finished");
}

/// Copy session output into Output frames until the session's output ends.
/// Once the peer is gone output is drained and discarded.
async fn pump_output(conn: Arc<Connection>, session: Arc<Session>) {
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    let mut peer_gone = false;
    loop {
        match session.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if !peer_gone && !conn.send(Frame::Output(buf[..n].to_vec())).await {
                    debug!("peer gone, discarding output");
                    peer_gone = true;
                }
            }
            Err(e) => {
                debug!(error = %e, "session read ended");
                break;
            }
        }
    }
    debug!("output pump finished");
}

/// Wait for the session to end, report it, and tear the connection down
async fn watch_exit(
    conn: Arc<Connection>,
    session: Arc<Session>,
    pump: JoinHandle<()>,
    grace: Duration,
) {
    let result = session.wait().await;
    // Flush remaining output ahead of the Exit frame
    if tokio::time::timeout(grace, pump).await.is_err() {
        debug!("output still flowing after exit, not waiting any longer");
    }
    conn.set_state(ConnectionState::Exiting);

    let exit = match result {
        Err(SessionError::Killed) => {
            debug!("session killed during teardown");
            None
        }
        Ok(()) => Some(ExitNotification {
            code: session.exit_code(),
            message: String::new(),
        }),
        Err(e) => {
            info!(code = e.exit_code(), error = %e, "session exited with error");
            Some(ExitNotification {
                code: e.exit_code(),
                message: e.to_string(),
            })
        }
    };

    if let Some(exit) = exit {
        info!(code = exit.code, "session exited");
        conn.send(Frame::Exit(exit)).await;
        tokio::time::sleep(grace).await;
    }

    if let Err(e) = session.close().await {
        warn!(error = %e, "failed to close session");
    }
    conn.send_close().await;
    conn.set_state(ConnectionState::Closed);
    conn.cancel.cancel();
}

/// Release the session when the dispatch loop ends
async fn teardown(conn: &Arc<Connection>) {
    if conn.state() != ConnectionState::Closed {
        conn.set_state(ConnectionState::Exiting);
    }
    if let Some(bound) = conn.bound() {
        if bound.options.wait_until_finished && !bound.session.has_exited() {
            info!("peer left, session keeps running until it exits");
        } else if let Err(e) = bound.session.close().await {
            warn!(error = %e, "failed to close session");
        }
    }
    conn.cancel.cancel();
    conn.set_state(ConnectionState::Closed);
}

/// The only task that writes to the socket
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            item = rx.recv() => item,
            _ = cancel.cancelled() => None,
        };
        match next {
            Some(Outbound::Frame(frame)) => {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                    debug!(error = %e, "websocket write failed");
                    cancel.cancel();
                    return;
                }
            }
            Some(Outbound::Close) | None => break,
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn heartbeat_loop(conn: Arc<Connection>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !conn.send(Frame::HeartBeat(None)).await {
                    break;
                }
            }
        }
    }
}
