//! Line-oriented transcript source.
//!
//! Each input line is one recognised utterance. A line starting with `~` is
//! an interim hypothesis; everything else is final. End of input is treated
//! as the caller hanging up.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::debug;

use grievance_core::TranscriptEvent;

const INTERIM_MARKER: char = '~';

pub fn parse_line(line: &str) -> TranscriptEvent {
    match line.strip_prefix(INTERIM_MARKER) {
        Some(rest) => TranscriptEvent::interim(rest.trim()),
        None => TranscriptEvent::final_transcript(line.trim()),
    }
}

/// Forward lines until EOF or until the session stops listening.
/// Returns the number of events delivered.
pub async fn forward_lines<R>(reader: R, tx: mpsc::Sender<TranscriptEvent>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut sent = 0usize;
    while let Some(line) = lines.next_line().await? {
        if tx.send(parse_line(&line)).await.is_err() {
            debug!("session no longer accepting transcripts");
            break;
        }
        sent += 1;
    }
    Ok(sent)
}
