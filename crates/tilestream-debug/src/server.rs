//! Line-delimited JSON debug server over TCP

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::protocol::{parse_command, DebugCommand, DebugResponse, ProtocolError};

/// Longest accepted command line; longer lines are answered with an error
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Implemented by the application to answer debug commands
pub trait DebugHandler: Send + Sync + 'static {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse;
}

pub type SharedHandler = Arc<Mutex<dyn DebugHandler>>;

/// Running debug server. Dropping it stops accepting new clients.
pub struct DebugServer {
    local_addr: Option<SocketAddr>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl DebugServer {
    /// Start listening on 127.0.0.1:`port` in the background. Bind errors are
    /// logged. Must be called from within a tokio runtime.
    pub fn start(handler: SharedHandler, port: u16) -> Self {
        let accept_task = tokio::spawn(async move {
            let addr = format!("127.0.0.1:{}", port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    log::info!("Debug server listening on {}", addr);
                    accept_loop(listener, handler).await;
                }
                Err(e) => log::error!("Failed to bind debug server on {}: {}", addr, e),
            }
        });
        Self { local_addr: None, accept_task }
    }

    /// Bind first, then serve in the background. Port 0 picks a free port,
    /// see [`DebugServer::local_addr`].
    pub async fn bind(handler: SharedHandler, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Debug server listening on {}", local_addr);
        let accept_task = tokio::spawn(accept_loop(listener, handler));
        Ok(Self { local_addr: Some(local_addr), accept_task })
    }

    /// Bound address, known only for servers created with [`DebugServer::bind`]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for DebugServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, handler: SharedHandler) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::info!("Debug client connected from {}", peer);
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_client(stream, handler).await {
                        log::warn!("Debug client {} dropped: {}", peer, e);
                    }
                    log::info!("Debug client disconnected: {}", peer);
                });
            }
            Err(e) => log::error!("Debug server accept error: {}", e),
        }
    }
}

enum LineRead {
    Eof,
    Line,
    TooLong,
}

/// Read one newline-terminated command into `buf`, holding at most
/// `MAX_LINE_BYTES + 1` bytes. The rest of an oversized line is discarded.
async fn read_command_line(reader: &mut BufReader<OwnedReadHalf>, buf: &mut Vec<u8>) -> std::io::Result<LineRead> {
    buf.clear();
    let n = (&mut *reader).take(MAX_LINE_BYTES as u64 + 1).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') || buf.len() <= MAX_LINE_BYTES {
        return Ok(LineRead::Line);
    }

    loop {
        buf.clear();
        let n = (&mut *reader).take(MAX_LINE_BYTES as u64).read_until(b'\n', buf).await?;
        if n == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    buf.clear();
    Ok(LineRead::TooLong)
}

/// Answer one client until it hangs up
async fn serve_client(stream: TcpStream, handler: SharedHandler) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        let response = match read_command_line(&mut reader, &mut buf).await? {
            LineRead::Eof => return Ok(()),
            LineRead::TooLong => DebugResponse::error(format!("command longer than {} bytes", MAX_LINE_BYTES)),
            LineRead::Line => match std::str::from_utf8(&buf) {
                Err(_) => DebugResponse::error("command is not valid UTF-8"),
                Ok(line) => match parse_command(line) {
                    Ok(cmd) => {
                        log::debug!("Debug command: {:?}", cmd);
                        handler.lock().await.handle_command(cmd)
                    }
                    Err(ProtocolError::Empty) => continue,
                    Err(e) => DebugResponse::error(e.to_string()),
                },
            },
        };
        write_response(&mut writer, &response).await?;
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &DebugResponse) -> std::io::Result<()> {
    let mut json = serde_json::to_string(response).unwrap_or_else(|e| {
        format!("{{\"status\":\"error\",\"message\":\"Serialize error: {}\"}}", e)
    });
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseData;
    use tokio::io::AsyncReadExt;

    struct CountingHandler {
        pings: u32,
    }

    impl DebugHandler for CountingHandler {
        fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse {
            match cmd {
                DebugCommand::Ping => {
                    self.pings += 1;
                    DebugResponse::ok(ResponseData::Pong { message: format!("pong {}", self.pings) })
                }
                _ => DebugResponse::error("unsupported"),
            }
        }
    }

    async fn connect() -> (DebugServer, BufReader<TcpStream>) {
        let handler: SharedHandler = Arc::new(Mutex::new(CountingHandler { pings: 0 }));
        let server = DebugServer::bind(handler, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        (server, BufReader::new(stream))
    }

    async fn round_trip(client: &mut BufReader<TcpStream>, line: &str) -> String {
        client.get_mut().write_all(line.as_bytes()).await.unwrap();
        let mut response = String::new();
        client.read_line(&mut response).await.unwrap();
        response
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commands_answered_in_order() {
        let (_server, mut client) = connect().await;

        let first = round_trip(&mut client, "{\"cmd\":\"Ping\"}\n").await;
        assert_eq!(first.trim(), r#"{"status":"ok","data":{"message":"pong 1"}}"#);

        // blank lines get no answer
        let second = round_trip(&mut client, "\n{\"cmd\":\"Ping\"}\n").await;
        assert_eq!(second.trim(), r#"{"status":"ok","data":{"message":"pong 2"}}"#);

        let unsupported = round_trip(&mut client, "{\"cmd\":\"GetStats\"}\n").await;
        assert_eq!(unsupported.trim(), r#"{"status":"error","message":"unsupported"}"#);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_and_oversized_lines() {
        let (_server, mut client) = connect().await;

        let bad = round_trip(&mut client, "{oops\n").await;
        assert!(bad.contains("invalid command JSON"));

        let long = format!("{}\n", "x".repeat(MAX_LINE_BYTES + 1));
        let too_long = round_trip(&mut client, &long).await;
        assert!(too_long.contains("longer than"));

        // the connection survives both
        let ok = round_trip(&mut client, "{\"cmd\":\"Ping\"}\n").await;
        assert!(ok.contains("pong 1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unterminated_flood_is_discarded() {
        let (_server, mut client) = connect().await;

        // several buffers' worth of bytes before the newline, written in pieces
        let chunk = "y".repeat(MAX_LINE_BYTES);
        for _ in 0..4 {
            client.get_mut().write_all(chunk.as_bytes()).await.unwrap();
        }
        let too_long = round_trip(&mut client, "\n").await;
        assert!(too_long.contains("longer than"));

        // a line of exactly the limit is still parsed
        let at_limit = round_trip(&mut client, &format!("{}\n", "z".repeat(MAX_LINE_BYTES))).await;
        assert!(at_limit.contains("invalid command JSON"));

        let ok = round_trip(&mut client, "{\"cmd\":\"Ping\"}\n").await;
        assert!(ok.contains("pong 1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_client_hangup_ends_session() {
        let (server, client) = connect().await;
        let mut stream = client.into_inner();
        stream.shutdown().await.unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(server);
    }
}
