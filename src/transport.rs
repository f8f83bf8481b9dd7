//! Chat transport boundary, plus a line-oriented console transport for local runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One inbound chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub channel: String,
    /// Raw username as the transport reported it.
    pub username: String,
    pub text: String,
    pub is_moderator: bool,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport rejected credentials: {0}")]
    Auth(String),
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Start delivering inbound messages into `inbound`. Credentials are fixed for
    /// the lifetime of the connection; a new token needs disconnect + connect.
    async fn connect(
        &self,
        access_token: &str,
        inbound: mpsc::Sender<ChatMessage>,
    ) -> Result<(), TransportError>;

    async fn say(&self, channel: &str, text: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Reads `#channel user[@mod]: text` lines from stdin and prints replies as
/// `#channel> text`. End of input cancels `on_close`.
pub struct ConsoleTransport {
    on_close: CancellationToken,
    reader: Mutex<Option<CancellationToken>>,
}

impl ConsoleTransport {
    pub fn new(on_close: CancellationToken) -> Self {
        Self {
            on_close,
            reader: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn connect(
        &self,
        access_token: &str,
        inbound: mpsc::Sender<ChatMessage>,
    ) -> Result<(), TransportError> {
        if access_token.is_empty() {
            return Err(TransportError::Auth("empty access token".into()));
        }

        let stop = CancellationToken::new();
        if let Some(previous) = self.reader.lock().replace(stop.clone()) {
            previous.cancel();
        }
        let on_close = self.on_close.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    _ = stop.cancelled() => return,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => match parse_console_line(&line) {
                        Some(msg) => {
                            if inbound.send(msg).await.is_err() {
                                return;
                            }
                        }
                        None => debug!(line = %line, "ignoring malformed console line"),
                    },
                    Ok(None) => {
                        info!("console input closed");
                        on_close.cancel();
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "console read failed");
                        on_close.cancel();
                        return;
                    }
                }
            }
        });

        info!("console transport connected");
        Ok(())
    }

    async fn say(&self, channel: &str, text: &str) -> Result<(), TransportError> {
        if self.reader.lock().is_none() {
            return Err(TransportError::NotConnected);
        }
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("#{channel}> {text}\n").as_bytes())
            .await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(reader) = self.reader.lock().take() {
            reader.cancel();
            info!("console transport disconnected");
        }
        Ok(())
    }
}

/// `#channel user: text`, with `user@mod` marking a moderator.
pub fn parse_console_line(line: &str) -> Option<ChatMessage> {
    let (channel, rest) = line.trim().split_once(' ')?;
    let channel = channel.strip_prefix('#')?;
    let (user, text) = rest.split_once(':')?;
    let user = user.trim();
    let (username, is_moderator) = match user.strip_suffix("@mod") {
        Some(name) => (name, true),
        None => (user, false),
    };
    if channel.is_empty() || username.is_empty() {
        return None;
    }
    Some(ChatMessage {
        channel: channel.to_string(),
        username: username.to_string(),
        text: text.trim_start().to_string(),
        is_moderator,
    })
}
