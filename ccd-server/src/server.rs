//! Line-oriented TCP command server.
//!
//! Each client gets its own task. Commands are dispatched on the blocking
//! pool because exposure verbs hold the camera for as long as the hardware
//! takes; status verbs from other clients keep being answered meanwhile.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::camera::CameraHandle;
use crate::dialect::{tokenize, CommandDialect, IceDialect, MmtDialect};

/// Dispatches command lines to the first dialect that accepts them.
pub struct CommandServer {
    dialects: Vec<Box<dyn CommandDialect>>,
}

/// True for `closeconnection`, with or without a tool prefix.
fn is_close_command(line: &str) -> bool {
    tokenize(line).first().is_some_and(|verb| {
        let verb = verb.rsplit('.').next().unwrap_or(verb);
        verb.eq_ignore_ascii_case("closeconnection")
    })
}

impl CommandServer {
    /// Server speaking the MMT verbs first, then the ICE tools.
    pub fn new(camera: CameraHandle) -> Self {
        Self::with_dialects(vec![
            Box::new(MmtDialect::new(camera.clone())),
            Box::new(IceDialect::new(camera)),
        ])
    }

    pub fn with_dialects(dialects: Vec<Box<dyn CommandDialect>>) -> Self {
        Self { dialects }
    }

    /// Reply to one command line.
    pub fn dispatch(&self, line: &str) -> String {
        for dialect in &self.dialects {
            if let Some(reply) = dialect.handle(line) {
                return reply;
            }
        }
        let verb = tokenize(line).into_iter().next().unwrap_or_default();
        warn!("Unrecognized command: {line}");
        format!("ERROR unrecognized command: {verb}")
    }

    /// Accept clients until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("Command server listening on {}", listener.local_addr()?);
        loop {
            let (socket, addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_client(socket, addr).await {
                    warn!("Client {addr} error: {e}");
                }
            });
        }
    }

    async fn handle_client(self: Arc<Self>, socket: TcpStream, addr: SocketAddr) -> std::io::Result<()> {
        info!("Client connected: {addr}");
        let (reader, mut writer) = socket.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            debug!("{addr} -> {line}");

            let close = is_close_command(&line);
            let server = Arc::clone(&self);
            let command = line.clone();
            let reply = tokio::task::spawn_blocking(move || server.dispatch(&command))
                .await
                .unwrap_or_else(|e| {
                    error!("Command '{line}' failed: {e}");
                    format!("ERROR command failed: {e}")
                });
            debug!("{addr} <- {reply}");

            writer.write_all(reply.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            if close {
                break;
            }
        }

        info!("Client disconnected: {addr}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl CommandDialect for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn handle(&self, line: &str) -> Option<String> {
            line.strip_prefix("echo ").map(|rest| format!("OK {rest}"))
        }
    }

    #[test]
    fn test_dispatch_falls_through_dialects() {
        let server = CommandServer::with_dialects(vec![Box::new(Echo)]);

        assert_eq!(server.dispatch("echo hello"), "OK hello");
        assert_eq!(
            server.dispatch("launch rocket"),
            "ERROR unrecognized command: launch"
        );
    }

    #[test]
    fn test_close_command_detection() {
        assert!(is_close_command("closeconnection"));
        assert!(is_close_command("CloseConnection"));
        assert!(is_close_command("ice.closeconnection"));
        assert!(!is_close_command("get camtemp"));
        assert!(!is_close_command(""));
    }
}
