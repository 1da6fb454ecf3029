use std::collections::VecDeque;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::ByteStream;

/// One proposed corrective action, e.g. moving a file to where it belongs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairCandidate {
    pub from: String,
    pub to: String,
    pub strategy: String,
    /// Always within [0, 1]
    pub confidence: f64,
}

/// Parameters of a repair preview run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub request_id: Uuid,
    /// Library paths to analyze; empty means the whole library
    #[serde(default)]
    pub roots: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RepairRequest {
    pub fn new(roots: Vec<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            roots,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProgress {
    pub processed: u64,
    #[serde(default)]
    pub total: Option<u64>,
}

/// One line of the repair stream
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    Item(RepairCandidate),
    Progress(StreamProgress),
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
    Done {
        #[serde(default)]
        total: Option<u64>,
    },
}

/// What an ingestion yields to its consumer, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Item(RepairCandidate),
    Progress(StreamProgress),
    /// Terminal failure reported by the backend or the transport
    Error(String),
    /// Completion marker; nothing follows
    Done,
}

/// Splits a byte stream into complete lines, holding back a trailing partial line
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Take the final unterminated line at a clean end of stream
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Drop the partial line; returns how many bytes were thrown away
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Parse one line; blank, malformed and unknown-type lines yield None
pub fn parse_line(line: &str) -> Option<StreamMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamMessage>(line) {
        Ok(StreamMessage::Item(mut candidate)) => {
            candidate.confidence = if candidate.confidence.is_nan() {
                0.0
            } else {
                candidate.confidence.clamp(0.0, 1.0)
            };
            Some(StreamMessage::Item(candidate))
        }
        Ok(message) => Some(message),
        Err(e) => {
            debug!("Skipping unparseable stream line ({}): {}", e, truncate(line, 120));
            None
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}

struct IngestState {
    source: ByteStream,
    decoder: LineDecoder,
    ready: VecDeque<IngestEvent>,
    cancel: CancellationToken,
    /// No more input will be read
    finished: bool,
    /// A terminal message (done/error) has been queued
    terminated: bool,
    skipped: usize,
}

impl IngestState {
    async fn next_event(&mut self) -> Option<IngestEvent> {
        loop {
            if self.cancel.is_cancelled() {
                self.abort();
                return None;
            }
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }

            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => continue,
                chunk = self.source.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for line in self.decoder.push(&bytes) {
                        self.accept_line(&line);
                    }
                }
                Some(Err(e)) => {
                    self.finished = true;
                    self.decoder.discard();
                    if !self.terminated {
                        self.terminated = true;
                        self.ready.push_back(IngestEvent::Error(e.to_string()));
                    }
                }
                None => {
                    self.finished = true;
                    if let Some(line) = self.decoder.finish() {
                        self.accept_line(&line);
                    }
                    if !self.terminated {
                        self.terminated = true;
                        self.ready
                            .push_back(IngestEvent::Error("stream closed before completion".to_string()));
                    }
                }
            }
        }
    }

    fn accept_line(&mut self, line: &str) {
        if self.terminated {
            return;
        }
        match parse_line(line) {
            Some(StreamMessage::Item(candidate)) => self.ready.push_back(IngestEvent::Item(candidate)),
            Some(StreamMessage::Progress(progress)) => self.ready.push_back(IngestEvent::Progress(progress)),
            Some(StreamMessage::Error { message }) => {
                self.terminated = true;
                self.finished = true;
                self.ready.push_back(IngestEvent::Error(message));
            }
            Some(StreamMessage::Done { .. }) => {
                self.terminated = true;
                self.finished = true;
                self.ready.push_back(IngestEvent::Done);
            }
            None => {
                if !line.trim().is_empty() {
                    self.skipped += 1;
                }
            }
        }
    }

    fn abort(&mut self) {
        if self.finished && self.ready.is_empty() {
            return;
        }
        let dropped = self.decoder.discard();
        info!(
            "Repair stream canceled ({} queued event(s) and {} buffered byte(s) discarded, {} line(s) skipped)",
            self.ready.len(),
            dropped,
            self.skipped
        );
        self.ready.clear();
        self.finished = true;
    }
}

/// Turn a newline-delimited byte stream into events, one per line, as they arrive
///
/// Nothing is buffered beyond the current partial line. Once `cancel` fires
/// the stream ends; whatever was not yet handed out is dropped.
pub fn ingest(source: ByteStream, cancel: CancellationToken) -> BoxStream<'static, IngestEvent> {
    let state = IngestState {
        source,
        decoder: LineDecoder::new(),
        ready: VecDeque::new(),
        cancel,
        finished: false,
        terminated: false,
        skipped: 0,
    };
    futures::stream::unfold(state, |mut state| async move {
        state.next_event().await.map(|event| (event, state))
    })
    .boxed()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewOutcome {
    Completed,
    Failed(String),
    Canceled,
}

/// A running repair preview: its events plus everything received so far
///
/// Candidates are append-only; a cancel never retracts what was delivered.
pub struct RepairPreview {
    events: BoxStream<'static, IngestEvent>,
    cancel: CancellationToken,
    candidates: Vec<RepairCandidate>,
    progress: Option<StreamProgress>,
    outcome: Option<PreviewOutcome>,
}

impl RepairPreview {
    pub fn new(source: ByteStream, cancel: CancellationToken) -> Self {
        Self {
            events: ingest(source, cancel.clone()),
            cancel,
            candidates: Vec::new(),
            progress: None,
            outcome: None,
        }
    }

    /// Next event, recorded before it is returned
    pub async fn next(&mut self) -> Option<IngestEvent> {
        let event = self.events.next().await;
        match &event {
            Some(IngestEvent::Item(candidate)) => self.candidates.push(candidate.clone()),
            Some(IngestEvent::Progress(progress)) => self.progress = Some(*progress),
            Some(IngestEvent::Error(message)) => self.outcome = Some(PreviewOutcome::Failed(message.clone())),
            Some(IngestEvent::Done) => self.outcome = Some(PreviewOutcome::Completed),
            None => {
                if self.outcome.is_none() {
                    self.outcome = Some(PreviewOutcome::Canceled);
                }
            }
        }
        event
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn candidates(&self) -> &[RepairCandidate] {
        &self.candidates
    }

    pub fn progress(&self) -> Option<StreamProgress> {
        self.progress
    }

    pub fn outcome(&self) -> Option<&PreviewOutcome> {
        self.outcome.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::receiver_stream;
    use crate::error::{MonitorError, Result};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn item_line(n: u32) -> String {
        format!(
            "{{\"type\":\"item\",\"from\":\"/in/{n}.mkv\",\"to\":\"/lib/{n}.mkv\",\"strategy\":\"move\",\"confidence\":0.9}}\n"
        )
    }

    fn preview() -> (mpsc::UnboundedSender<Result<Vec<u8>>>, RepairPreview) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, RepairPreview::new(receiver_stream(rx), CancellationToken::new()))
    }

    async fn next_within(preview: &mut RepairPreview) -> Option<IngestEvent> {
        tokio::time::timeout(Duration::from_secs(2), preview.next())
            .await
            .expect("event did not arrive")
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"type\":").is_empty());
        assert_eq!(decoder.push(b"\"done\"}\r\nab"), vec!["{\"type\":\"done\"}".to_string()]);
        assert_eq!(decoder.pending(), 2);
        assert_eq!(decoder.finish(), Some("ab".to_string()));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_parse_line_skips_garbage_and_unknown_types() {
        assert_eq!(parse_line("not json"), None);
        assert_eq!(parse_line("{\"type\":\"heartbeat\"}"), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(
            parse_line("{\"type\":\"progress\",\"processed\":3,\"total\":10}"),
            Some(StreamMessage::Progress(StreamProgress { processed: 3, total: Some(10) }))
        );
    }

    #[test]
    fn test_confidence_is_clamped() {
        let line = "{\"type\":\"item\",\"from\":\"a\",\"to\":\"b\",\"strategy\":\"rename\",\"confidence\":1.7}";
        match parse_line(line) {
            Some(StreamMessage::Item(candidate)) => assert_eq!(candidate.confidence, 1.0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_items_arrive_before_completion() {
        let (tx, mut preview) = preview();

        tx.send(Ok(item_line(1).into_bytes())).unwrap();
        assert!(matches!(next_within(&mut preview).await, Some(IngestEvent::Item(_))));
        assert_eq!(preview.candidates().len(), 1);

        tx.send(Ok(item_line(2).into_bytes())).unwrap();
        assert!(matches!(next_within(&mut preview).await, Some(IngestEvent::Item(_))));

        tx.send(Ok(b"{\"type\":\"progress\",\"processed\":2,\"total\":3}\n".to_vec())).unwrap();
        assert_eq!(
            next_within(&mut preview).await,
            Some(IngestEvent::Progress(StreamProgress { processed: 2, total: Some(3) }))
        );

        tx.send(Ok(item_line(3).into_bytes())).unwrap();
        assert!(matches!(next_within(&mut preview).await, Some(IngestEvent::Item(_))));
        assert_eq!(preview.candidates().len(), 3);

        tx.send(Ok(b"{\"type\":\"done\"}\n".to_vec())).unwrap();
        assert_eq!(next_within(&mut preview).await, Some(IngestEvent::Done));
        assert_eq!(next_within(&mut preview).await, None);

        let order: Vec<&str> = preview.candidates().iter().map(|c| c.from.as_str()).collect();
        assert_eq!(order, vec!["/in/1.mkv", "/in/2.mkv", "/in/3.mkv"]);
        assert_eq!(preview.outcome(), Some(&PreviewOutcome::Completed));
    }

    #[tokio::test]
    async fn test_cancel_after_second_item_keeps_two() {
        let (tx, mut preview) = preview();
        let body = format!(
            "{}{}{{\"type\":\"progress\",\"processed\":2}}\n{}{{\"type\":\"done\"}}\n{{\"type\":\"it",
            item_line(1),
            item_line(2),
            item_line(3)
        );
        tx.send(Ok(body.into_bytes())).unwrap();

        assert!(matches!(next_within(&mut preview).await, Some(IngestEvent::Item(_))));
        assert!(matches!(next_within(&mut preview).await, Some(IngestEvent::Item(_))));
        preview.cancel();

        assert_eq!(next_within(&mut preview).await, None);
        assert_eq!(preview.candidates().len(), 2);
        assert_eq!(preview.outcome(), Some(&PreviewOutcome::Canceled));
    }

    #[tokio::test]
    async fn test_unparseable_lines_are_skipped() {
        let (tx, mut preview) = preview();
        let body = format!("{}garbage\n\n{}{{\"type\":\"done\"}}\n", item_line(1), item_line(2));
        tx.send(Ok(body.into_bytes())).unwrap();

        let mut events = Vec::new();
        while let Some(event) = next_within(&mut preview).await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(preview.candidates().len(), 2);
    }

    #[tokio::test]
    async fn test_error_message_is_terminal() {
        let (tx, mut preview) = preview();
        let body = format!("{}{{\"type\":\"error\",\"message\":\"index locked\"}}\n{}", item_line(1), item_line(2));
        tx.send(Ok(body.into_bytes())).unwrap();

        assert!(matches!(next_within(&mut preview).await, Some(IngestEvent::Item(_))));
        assert_eq!(next_within(&mut preview).await, Some(IngestEvent::Error("index locked".to_string())));
        assert_eq!(next_within(&mut preview).await, None);
        assert_eq!(preview.candidates().len(), 1);
        assert_eq!(preview.outcome(), Some(&PreviewOutcome::Failed("index locked".to_string())));
    }

    #[tokio::test]
    async fn test_close_without_done_reports_error() {
        let (tx, mut preview) = preview();
        // Final line without a newline is still complete at a clean close
        tx.send(Ok(item_line(1).trim_end().as_bytes().to_vec())).unwrap();
        drop(tx);

        assert!(matches!(next_within(&mut preview).await, Some(IngestEvent::Item(_))));
        assert!(matches!(next_within(&mut preview).await, Some(IngestEvent::Error(_))));
        assert_eq!(next_within(&mut preview).await, None);
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let (tx, mut preview) = preview();
        tx.send(Ok(item_line(1).into_bytes())).unwrap();
        tx.send(Err(MonitorError::Transport("connection reset".to_string()))).unwrap();

        assert!(matches!(next_within(&mut preview).await, Some(IngestEvent::Item(_))));
        match next_within(&mut preview).await {
            Some(IngestEvent::Error(message)) => assert!(message.contains("connection reset")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(next_within(&mut preview).await, None);
        assert_eq!(preview.candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_input() {
        let (_tx, mut preview) = preview();
        let token = preview.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        assert_eq!(next_within(&mut preview).await, None);
        assert!(preview.candidates().is_empty());
    }
}
