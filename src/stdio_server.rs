use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::protocol::ProtocolHandler;

/// Inbound MCP over stdio: newline-delimited JSON on stdin/stdout.
///
/// stderr stays free for diagnostics (tracing writes there), so the
/// stdout protocol stream is never polluted. Runs until stdin reaches EOF
/// or `shutdown` is notified.
pub async fn serve(handler: Arc<ProtocolHandler>, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    info!("stdio MCP surface started");

    loop {
        let line = tokio::select! {
            _ = shutdown.notified() => {
                info!("stdio MCP surface shutting down");
                return Ok(());
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("stdin closed, stopping stdio surface");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                return Err(e.into());
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        debug!(bytes = line.len(), "stdio request");
        if let Some(response) = handler.handle_text(&line).await {
            let mut payload = response.to_string();
            payload.push('\n');
            stdout.write_all(payload.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
}
