//! Line-oriented activity sources.
//!
//! Each line carries one event, either as a bare name (`click`) or as a JSON
//! object with a `type` field (`{"type":"mousemove","x":10}`), which is what a
//! browser host gets from serializing a DOM event. Anything else is skipped.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::io::Stdin;
use tokio::net::UnixStream;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::ActivityError;
use super::ActivitySource;
use crate::domain::ActivityKind;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// JSON shape of a serialized DOM event; only the type matters.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
}

/// Parse a single line from an activity stream.
pub fn parse_activity_line(line: &str) -> Option<ActivityKind> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.starts_with('{') {
        return match serde_json::from_str::<RawEvent>(line) {
            Ok(raw) => ActivityKind::from_name(&raw.kind),
            Err(e) => {
                trace!("Ignoring malformed JSON line: {}", e);
                None
            }
        };
    }

    let kind = ActivityKind::from_name(line);
    if kind.is_none() {
        trace!("Ignoring event: {}", line);
    }
    kind
}

/// Activity source over any buffered reader. Ends at EOF.
pub struct LineSource<R> {
    reader: R,
    line: String,
}

impl<R> LineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }
}

impl LineSource<BufReader<Stdin>> {
    /// Read activity from the process's standard input.
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl<R> ActivitySource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_activity(&mut self) -> Result<ActivityKind, ActivityError> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .await
                .map_err(|e| ActivityError::ReadError(e.to_string()))?;

            if read == 0 {
                return Err(ActivityError::Disconnected);
            }

            if let Some(kind) = parse_activity_line(&self.line) {
                return Ok(kind);
            }
        }
    }
}

/// Activity source reading from a Unix stream socket, reconnecting on loss.
pub struct UnixSocketSource {
    path: PathBuf,
    reader: Option<BufReader<UnixStream>>,
    backoff: Duration,
}

impl UnixSocketSource {
    /// Connect to the activity socket at `path`.
    pub async fn connect(path: &Path) -> Result<Self, ActivityError> {
        if !path.exists() {
            return Err(ActivityError::SocketNotFound(path.display().to_string()));
        }

        info!("Connecting to activity socket: {}", path.display());
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| ActivityError::ConnectionFailed(e.to_string()))?;
        info!("Connected to activity socket");

        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(BufReader::new(stream)),
            backoff: INITIAL_BACKOFF,
        })
    }

    /// Attempt to reconnect to the socket.
    async fn reconnect(&mut self) -> Result<(), ActivityError> {
        warn!(
            "Activity socket connection lost. Retrying in {:?}...",
            self.backoff
        );

        tokio::time::sleep(self.backoff).await;

        // Exponential backoff with cap
        self.backoff = std::cmp::min(self.backoff * 2, MAX_BACKOFF);

        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| ActivityError::ConnectionFailed(e.to_string()))?;

        info!("Reconnected to activity socket");
        self.reader = Some(BufReader::new(stream));
        self.backoff = INITIAL_BACKOFF;

        Ok(())
    }
}

#[async_trait]
impl ActivitySource for UnixSocketSource {
    async fn next_activity(&mut self) -> Result<ActivityKind, ActivityError> {
        let mut line = String::new();
        loop {
            let reader = match &mut self.reader {
                Some(r) => r,
                None => {
                    // Keep retrying: a restarting host is expected to come back
                    if let Err(e) = self.reconnect().await {
                        debug!("Reconnect failed: {}", e);
                    }
                    continue;
                }
            };

            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    warn!("Activity socket stream ended (EOF)");
                    self.reader = None;
                }
                Ok(_) => {
                    if let Some(kind) = parse_activity_line(&line) {
                        return Ok(kind);
                    }
                }
                Err(e) => {
                    warn!("Read error: {}", e);
                    self.reader = None;
                }
            }
        }
    }
}
