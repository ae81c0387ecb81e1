//! External signal intake.
//!
//! The browser extension (and any display surface) talks to the daemon over a
//! Unix socket, one JSON object per line. Mutating signals are forwarded to
//! the tracker task over a channel; `status` is answered directly from the
//! durable store, which is the read-only path display surfaces are allowed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use revclock_core::PageContext;

use crate::registry::SessionRegistry;

/// One message on the intake socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntakeRequest {
    /// Page-context detection: a review page came into view.
    PageDetected { context: PageContext },
    /// Debounced user-input signal for a page.
    ActivityPing { context: PageContext },
    VisibilityChanged { context: PageContext, hidden: bool },
    /// Tab or window closed; the sender may supply its own measured duration.
    PageClosed {
        context: PageContext,
        #[serde(default)]
        duration_seconds: Option<i64>,
    },
    ReviewSubmitted { context: PageContext },
    Connectivity { online: bool },
    /// Manual sync trigger from a display surface.
    Sync,
    /// Read-only snapshot request; answered inline, never forwarded.
    Status,
}

/// Accepts connections on the intake socket until shutdown. Each connection
/// may carry any number of newline-delimited requests.
pub async fn run_listener(
    socket_path: PathBuf,
    registry: SessionRegistry,
    tx: mpsc::UnboundedSender<IntakeRequest>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create socket dir for {}", socket_path.display()))?;
    }
    // stale socket from an unclean previous shutdown
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("bind intake socket {}", socket_path.display()))?;
    info!("listening on {}", socket_path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let registry = registry.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, registry, tx).await {
                                debug!("intake connection closed: {e:#}");
                            }
                        });
                    }
                    Err(e) => warn!("intake accept failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    registry: SessionRegistry,
    tx: mpsc::UnboundedSender<IntakeRequest>,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut reply = handle_line(&line, &registry, &tx);
        reply.push('\n');
        write.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

fn handle_line(
    line: &str,
    registry: &SessionRegistry,
    tx: &mpsc::UnboundedSender<IntakeRequest>,
) -> String {
    match serde_json::from_str::<IntakeRequest>(line) {
        Err(e) => {
            warn!("unparseable intake request: {e}");
            json!({ "ok": false, "error": e.to_string() }).to_string()
        }
        Ok(IntakeRequest::Status) => match registry.snapshot() {
            Ok(snapshot) => json!({ "ok": true, "snapshot": snapshot }).to_string(),
            Err(e) => json!({ "ok": false, "error": e.to_string() }).to_string(),
        },
        Ok(request) => {
            if tx.send(request).is_err() {
                return json!({ "ok": false, "error": "tracker stopped" }).to_string();
            }
            json!({ "ok": true }).to_string()
        }
    }
}
