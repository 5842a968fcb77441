//! Replays recorded data-channel frames as a realtime transport

use async_stream::stream;
use futures::{Stream, StreamExt};
use sapp_session::{
    Credentials, RealtimeTransport, TransportConnection, TransportError, TransportEvents,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delivers frames from a recording, one every `interval`, after reporting
/// the connection as up.
///
/// Each `open` starts the recording from the beginning. Once the frames run
/// out the connection stays up and silent.
#[derive(Debug, Clone)]
pub struct ReplayTransport {
    frames: Arc<Vec<String>>,
    interval: Duration,
}

impl ReplayTransport {
    pub fn new(frames: Vec<String>, interval: Duration) -> Self {
        Self {
            frames: Arc::new(frames),
            interval,
        }
    }

    /// Load newline-delimited frames. Blank lines and lines starting with
    /// `#` are skipped.
    pub fn from_file(path: &Path, interval: Duration) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(parse_frames(&content), interval))
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }
}

fn parse_frames(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

fn paced(frames: Arc<Vec<String>>, interval: Duration) -> impl Stream<Item = String> {
    stream! {
        for frame in frames.iter() {
            tokio::time::sleep(interval).await;
            yield frame.clone();
        }
    }
}

impl RealtimeTransport for ReplayTransport {
    fn open(
        &self,
        credentials: &Credentials,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        tracing::info!(
            "Replaying {} frames into room {}",
            self.frames.len(),
            credentials.room
        );

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let frames = paced(Arc::clone(&self.frames), self.interval);

        tokio::spawn(async move {
            if !events.connected() {
                return;
            }
            let mut frames = std::pin::pin!(frames);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = frames.next() => match frame {
                        Some(frame) => {
                            if !events.data(frame) {
                                break;
                            }
                        }
                        None => {
                            tracing::info!("Replay finished");
                            break;
                        }
                    },
                }
            }
        });

        Ok(Box::new(ReplayConnection { cancel }))
    }
}

struct ReplayConnection {
    cancel: CancellationToken,
}

impl TransportConnection for ReplayConnection {
    fn close(&mut self) {
        self.cancel.cancel();
    }
}
