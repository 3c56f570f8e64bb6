//! Protocol side of the client: handshake, then the interactive exchange.

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use terminal_protocol::{ConnectRequest, ExitNotification, Frame, ResizeRequest};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use crate::client::ClientError;

const OUTGOING_QUEUE_DEPTH: usize = 64;
const EOT: u8 = 0x04;

/// Local events fed into a running session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientInput {
    /// Bytes typed or piped in
    Data(Vec<u8>),
    Resize { rows: u16, cols: u16 },
    /// Local input is exhausted; the remote shell gets Ctrl-D
    Eof,
    /// Leave the session without waiting for it to end
    Detach,
}

/// How a session ended on the client side
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Exited { code: i32, message: String },
    /// The server went away without reporting an exit
    Disconnected,
    Detached,
}

impl SessionEnd {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited { code, .. } => *code,
            Self::Disconnected | Self::Detached => 0,
        }
    }
}

/// Run one session over an established socket.
///
/// Sends `request`, waits for the server's Connect ack, then relays `input`
/// to the server and Output frames to `output` until the session ends.
/// Nothing from `input` is sent before the ack.
pub async fn run_session<S, W>(
    ws: WebSocketStream<S>,
    request: ConnectRequest,
    mut input: mpsc::Receiver<ClientInput>,
    mut output: W,
) -> Result<SessionEnd, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (sink, mut stream) = ws.split();
    let (tx, rx) = mpsc::channel::<Frame>(OUTGOING_QUEUE_DEPTH);
    let writer = tokio::spawn(write_loop(sink, rx));

    let result = async {
        let _ = tx.send(Frame::Connect(request)).await;
        await_ack(&mut stream, &tx).await?;
        debug!("session ready");
        interact(&mut stream, &tx, &mut input, &mut output).await
    }
    .await;

    // Dropping the last sender makes the writer close the socket
    drop(tx);
    if let Err(e) = writer.await {
        debug!(error = %e, "writer task ended abnormally");
    }
    result
}

async fn await_ack<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    tx: &mpsc::Sender<Frame>,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match next_frame(stream).await? {
            Incoming::Frame(frame) => frame,
            Incoming::Closed => return Err(ClientError::HandshakeClosed),
        };
        match frame {
            Frame::Connect(_) => return Ok(()),
            Frame::HeartBeat(_) => {
                let _ = tx.send(Frame::HeartBeat(None)).await;
            }
            Frame::Exit(ExitNotification { code, message }) => {
                return Err(ClientError::ConnectFailed { code, message });
            }
            other => debug!(kind = ?other.message_type(), "frame before connect ack ignored"),
        }
    }
}

async fn interact<S, W>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    tx: &mpsc::Sender<Frame>,
    input: &mut mpsc::Receiver<ClientInput>,
    output: &mut W,
) -> Result<SessionEnd, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input_open = true;
    loop {
        tokio::select! {
            incoming = next_frame(stream) => {
                let frame = match incoming? {
                    Incoming::Frame(frame) => frame,
                    Incoming::Closed => return Ok(SessionEnd::Disconnected),
                };
                match frame {
                    Frame::Output(data) => {
                        output.write_all(&data).await?;
                        output.flush().await?;
                    }
                    Frame::HeartBeat(_) => {
                        let _ = tx.send(Frame::HeartBeat(None)).await;
                    }
                    Frame::Exit(ExitNotification { code, message }) => {
                        debug!(code, "session exited");
                        return Ok(SessionEnd::Exited { code, message });
                    }
                    Frame::Error(e) => warn!(message = %e.message, "server reported an error"),
                    Frame::Unrecognized { type_byte, .. } => {
                        warn!(type_byte, "unrecognized frame type");
                    }
                    other => debug!(kind = ?other.message_type(), "ignoring frame"),
                }
            }
            event = input.recv(), if input_open => {
                let frame = match event {
                    Some(ClientInput::Data(data)) => Frame::Key(data),
                    Some(ClientInput::Resize { rows, cols }) => {
                        Frame::Resize(ResizeRequest { cols, rows })
                    }
                    Some(ClientInput::Eof) => Frame::Key(vec![EOT]),
                    Some(ClientInput::Detach) => return Ok(SessionEnd::Detached),
                    None => {
                        input_open = false;
                        continue;
                    }
                };
                if tx.send(frame).await.is_err() {
                    return Ok(SessionEnd::Disconnected);
                }
            }
        }
    }
}

enum Incoming {
    Frame(Frame),
    /// Clean or abnormal-but-non-fatal end of the connection
    Closed,
}

/// Next decodable frame, skipping control messages and malformed frames
async fn next_frame<S>(stream: &mut SplitStream<WebSocketStream<S>>) -> Result<Incoming, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let bytes = match stream.next().await {
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Close(frame))) => return close_outcome(frame),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return transport_outcome(e),
            None => return Ok(Incoming::Closed),
        };
        match Frame::decode(&bytes) {
            Ok(frame) => return Ok(Incoming::Frame(frame)),
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }
}

fn close_outcome(frame: Option<CloseFrame>) -> Result<Incoming, ClientError> {
    match frame {
        None => Ok(Incoming::Closed),
        Some(f) if matches!(f.code, CloseCode::Normal | CloseCode::Away) => Ok(Incoming::Closed),
        Some(f) => {
            let reason: &str = &f.reason;
            Err(ClientError::AbnormalClose {
                code: u16::from(f.code),
                reason: reason.to_string(),
            })
        }
    }
}

fn transport_outcome(err: tungstenite::Error) -> Result<Incoming, ClientError> {
    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
            debug!("connection dropped without close handshake");
            Ok(Incoming::Closed)
        }
        other => Err(ClientError::Transport(other)),
    }
}

/// The only task that writes to the socket
async fn write_loop<S>(
    mut sink: futures::stream::SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Frame>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
            debug!(error = %e, "websocket write failed");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::MaybeTlsStream;

    type ServerSide = WebSocketStream<TcpStream>;

    /// Accept one connection and hand the server side to `script`
    async fn with_server<F, Fut>(script: F) -> (SocketAddr, tokio::task::JoinHandle<()>)
    where
        F: FnOnce(ServerSide) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            script(ws).await;
        });
        (addr, handle)
    }

    async fn dial(addr: SocketAddr) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        ws
    }

    async fn recv_frame(ws: &mut ServerSide) -> Frame {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => return Frame::decode(&data).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send_frame(ws: &mut ServerSide, frame: Frame) {
        ws.send(Message::Binary(frame.encode().unwrap().into()))
            .await
            .unwrap();
    }

    // ── handshake ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_output_then_exit() {
        let (addr, server) = with_server(|mut ws| async move {
            let Frame::Connect(req) = recv_frame(&mut ws).await else {
                panic!("expected connect");
            };
            assert_eq!(req.shell, "/bin/sh");
            send_frame(&mut ws, Frame::Connect(ConnectRequest::default())).await;
            send_frame(&mut ws, Frame::Output(b"hi\r\n".to_vec())).await;
            send_frame(
                &mut ws,
                Frame::Exit(ExitNotification {
                    code: 0,
                    message: String::new(),
                }),
            )
            .await;
        })
        .await;

        let (_tx, rx) = mpsc::channel(4);
        let mut out = Vec::new();
        let request = ConnectRequest {
            shell: "/bin/sh".into(),
            ..Default::default()
        };
        let end = run_session(dial(addr).await, request, rx, &mut out)
            .await
            .unwrap();
        assert_eq!(
            end,
            SessionEnd::Exited {
                code: 0,
                message: String::new()
            }
        );
        assert_eq!(out, b"hi\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_before_ack_is_connect_failure() {
        let (addr, server) = with_server(|mut ws| async move {
            recv_frame(&mut ws).await;
            send_frame(
                &mut ws,
                Frame::Exit(ExitNotification {
                    code: 1,
                    message: "failed to connect: boom".into(),
                }),
            )
            .await;
            let _ = ws.close(None).await;
        })
        .await;

        let (_tx, rx) = mpsc::channel(4);
        let err = run_session(dial(addr).await, ConnectRequest::default(), rx, Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectFailed { code: 1, .. }));
        assert_eq!(err.exit_code(), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_ack() {
        let (addr, server) = with_server(|mut ws| async move {
            recv_frame(&mut ws).await;
            let _ = ws.close(None).await;
        })
        .await;

        let (_tx, rx) = mpsc::channel(4);
        let err = run_session(dial(addr).await, ConnectRequest::default(), rx, Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::HandshakeClosed));
        server.await.unwrap();
    }

    // ── interactive ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_input_waits_for_ack_and_heartbeat_is_answered() {
        let (addr, server) = with_server(|mut ws| async move {
            assert!(matches!(recv_frame(&mut ws).await, Frame::Connect(_)));
            send_frame(&mut ws, Frame::HeartBeat(None)).await;
            // Queued input must not overtake the heartbeat reply
            assert_eq!(recv_frame(&mut ws).await, Frame::HeartBeat(None));
            send_frame(&mut ws, Frame::Connect(ConnectRequest::default())).await;

            assert_eq!(
                recv_frame(&mut ws).await,
                Frame::Resize(ResizeRequest { cols: 120, rows: 40 })
            );
            assert_eq!(recv_frame(&mut ws).await, Frame::Key(b"ls\n".to_vec()));
            assert_eq!(recv_frame(&mut ws).await, Frame::Key(vec![EOT]));

            send_frame(&mut ws, Frame::HeartBeat(None)).await;
            assert_eq!(recv_frame(&mut ws).await, Frame::HeartBeat(None));
            send_frame(
                &mut ws,
                Frame::Exit(ExitNotification {
                    code: 3,
                    message: "exit status 3".into(),
                }),
            )
            .await;
        })
        .await;

        let (tx, rx) = mpsc::channel(8);
        tx.send(ClientInput::Resize { rows: 40, cols: 120 })
            .await
            .unwrap();
        tx.send(ClientInput::Data(b"ls\n".to_vec())).await.unwrap();
        tx.send(ClientInput::Eof).await.unwrap();
        drop(tx);

        let end = run_session(dial(addr).await, ConnectRequest::default(), rx, Vec::<u8>::new())
            .await
            .unwrap();
        assert_eq!(end.exit_code(), 3);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_ends_session() {
        let (addr, server) = with_server(|mut ws| async move {
            recv_frame(&mut ws).await;
            send_frame(&mut ws, Frame::Connect(ConnectRequest::default())).await;
            // Client closes after detaching
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        })
        .await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(ClientInput::Detach).await.unwrap();
        let end = run_session(dial(addr).await, ConnectRequest::default(), rx, Vec::<u8>::new())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Detached);
        assert_eq!(end.exit_code(), 0);
        server.await.unwrap();
    }

    // ── teardown ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_normal_close_is_disconnect() {
        let (addr, server) = with_server(|mut ws| async move {
            recv_frame(&mut ws).await;
            send_frame(&mut ws, Frame::Connect(ConnectRequest::default())).await;
            let _ = ws.close(None).await;
        })
        .await;

        let (_tx, rx) = mpsc::channel(4);
        let end = run_session(dial(addr).await, ConnectRequest::default(), rx, Vec::<u8>::new())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Disconnected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_close_code_is_fatal() {
        let (addr, server) = with_server(|mut ws| async move {
            recv_frame(&mut ws).await;
            send_frame(&mut ws, Frame::Connect(ConnectRequest::default())).await;
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Error,
                    reason: "boom".into(),
                }))
                .await;
        })
        .await;

        let (_tx, rx) = mpsc::channel(4);
        let err = run_session(dial(addr).await, ConnectRequest::default(), rx, Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AbnormalClose { code: 1011, .. }));
        server.await.unwrap();
    }
}
