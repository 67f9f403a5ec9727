//! Download-log ingestion from the HTTP tier.
//!
//! One newline-delimited JSON record per download; malformed lines are
//! logged and dropped, everything else flows to the secretary, which
//! batches the database writes.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};
use wheelhouse_model::DownloadRecord;

use super::secretary::{Event, SecretaryHandle};

const MAX_LINE: usize = 64 * 1024;

/// Serves one log-source connection until it closes.
pub async fn serve_logs<S>(stream: S, secretary: SecretaryHandle)
where
    S: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(
        stream,
        LinesCodec::new_with_max_length(MAX_LINE),
    );
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "download log line unreadable; dropping \
                       connection");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DownloadRecord>(&line) {
            Ok(record) => {
                secretary.send(Event::DownloadSeen(record)).await;
            }
            Err(err) => {
                warn!(%err, "malformed download record dropped");
            }
        }
    }
    debug!("download log connection closed");
}
