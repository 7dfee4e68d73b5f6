//! Per-board batch loop.
//!
//! A [`BatchDispatcher`] walks one board through the whole corpus: send a
//! batch, wait for both of its result messages, compare them (and forward
//! the first in cross-board mode), and only then move on. A board therefore
//! never holds more than one batch that it has not answered yet.

use std::sync::Arc;

use serde::Serialize;
use slog::{Logger, debug, info, o, warn};
use tokio::sync::mpsc;

use crate::config::Topology;
use crate::constants::RESULTS_PER_BATCH;
use crate::generator::Corpus;
use crate::oracle::{ComparisonResult, Verdict, render_diff};
use crate::transport::{BoardStream, FramedChannel, TransportError};
use crate::util::blob_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    AwaitingHandshake,
    Dispatching,
    BatchSent,
    AwaitingResult1,
    AwaitingResult2,
    Comparing,
    Done,
    Disconnected,
}

/// A connected board that has announced its name.
pub struct BoardSession<S> {
    name: String,
    endpoint: String,
    channel: FramedChannel<S>,
    cursor: usize,
    last_results: [Vec<u8>; RESULTS_PER_BATCH],
    state: SessionState,
}

impl<S: BoardStream> BoardSession<S> {
    /// Waits for the board's name frame. `endpoint` describes where the
    /// board was reached and is used for logs and the report.
    pub async fn accept(mut channel: FramedChannel<S>, endpoint: &str) -> Result<Self, TransportError> {
        let name = channel.recv_handshake().await?;
        Ok(Self {
            name,
            endpoint: endpoint.to_string(),
            channel,
            cursor: 0,
            last_results: Default::default(),
            state: SessionState::Dispatching,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Index of the first corpus word not yet acknowledged by the board.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_results(&self) -> &[Vec<u8>; RESULTS_PER_BATCH] {
        &self.last_results
    }
}

/// How a board session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SessionEnd {
    Completed,
    Disconnected(String),
    /// The session never started: unreachable endpoint, bad handshake, or a
    /// duplicate board name.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardOutcome {
    pub board: String,
    pub endpoint: String,
    pub batches_completed: usize,
    pub end: SessionEnd,
}

impl BoardOutcome {
    pub fn rejected(endpoint: &str, reason: String) -> Self {
        Self {
            board: String::new(),
            endpoint: endpoint.to_string(),
            batches_completed: 0,
            end: SessionEnd::Rejected(reason),
        }
    }
}

/// Everything one board produced.
#[derive(Debug, Clone)]
pub struct BoardRun {
    pub outcome: BoardOutcome,
    /// The board's two runs of every batch compared with each other.
    /// Comparisons between boards are made by the collector.
    pub comparisons: Vec<ComparisonResult>,
}

/// The first result of a batch, forwarded for cross-board comparison.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub board: String,
    pub batch_index: usize,
    pub blob: Vec<u8>,
}

/// What board tasks tell the cross-board collector.
#[derive(Debug, Clone)]
pub enum CrossBoardEvent {
    Result(BatchReport),
    /// The board is gone. It forwarded exactly batches `0..batches`.
    Retired { batches: usize },
}

#[derive(Clone)]
pub struct BatchDispatcher {
    corpus: Arc<Corpus>,
    batch_size: usize,
    topology: Topology,
    reports: Option<mpsc::Sender<CrossBoardEvent>>,
    logger: Logger,
}

impl BatchDispatcher {
    /// `reports` receives the first result of every batch and is only used
    /// with [`Topology::CrossBoard`].
    pub fn new(
        corpus: Arc<Corpus>,
        batch_size: usize,
        topology: Topology,
        reports: Option<mpsc::Sender<CrossBoardEvent>>,
        logger: Logger,
    ) -> Self {
        Self {
            corpus,
            batch_size: batch_size.max(1),
            topology,
            reports,
            logger,
        }
    }

    /// Drives `session` to corpus exhaustion or disconnect. Never fails:
    /// transport errors end the session and are recorded in the outcome.
    pub async fn run<S: BoardStream>(&self, session: &mut BoardSession<S>) -> BoardRun {
        let logger = self.logger.new(o!("board" => session.name.clone()));
        let mut comparisons = Vec::new();
        let mut batches_completed = 0;
        let end = match self
            .dispatch(session, &logger, &mut comparisons, &mut batches_completed)
            .await
        {
            Ok(()) => {
                session.state = SessionState::Done;
                info!(logger, "corpus exhausted"; "batches" => batches_completed);
                SessionEnd::Completed
            }
            Err(err) => {
                session.state = SessionState::Disconnected;
                warn!(logger, "board session ended early";
                    "error" => %err, "cursor" => session.cursor);
                SessionEnd::Disconnected(err.to_string())
            }
        };
        BoardRun {
            outcome: BoardOutcome {
                board: session.name.clone(),
                endpoint: session.endpoint.clone(),
                batches_completed,
                end,
            },
            comparisons,
        }
    }

    async fn dispatch<S: BoardStream>(
        &self,
        session: &mut BoardSession<S>,
        logger: &Logger,
        comparisons: &mut Vec<ComparisonResult>,
        batches_completed: &mut usize,
    ) -> Result<(), TransportError> {
        session.state = SessionState::Dispatching;
        let words = self.corpus.words();
        while session.cursor < words.len() {
            let batch_index = session.cursor / self.batch_size;
            let end = (session.cursor + self.batch_size).min(words.len());
            let batch = &words[session.cursor..end];

            session.channel.send_batch(batch).await?;
            session.state = SessionState::BatchSent;
            debug!(logger, "batch sent"; "batch" => batch_index, "words" => batch.len());

            session.state = SessionState::AwaitingResult1;
            let first = session.channel.recv_result().await?;
            session.state = SessionState::AwaitingResult2;
            let second = session.channel.recv_result().await?;
            debug!(logger, "results received";
                "batch" => batch_index, "first_bytes" => first.len(), "second_bytes" => second.len());

            session.cursor = end;
            session.state = SessionState::Comparing;
            let result = ComparisonResult::new(batch_index, &session.name, &session.name, &first, &second);
            log_comparison(logger, &result);
            comparisons.push(result);
            if let (Topology::CrossBoard, Some(reports)) = (self.topology, &self.reports) {
                let report = BatchReport {
                    board: session.name.clone(),
                    batch_index,
                    blob: first.clone(),
                };
                if reports.send(CrossBoardEvent::Result(report)).await.is_err() {
                    warn!(logger, "cross-board collector is gone, dropping result"; "batch" => batch_index);
                }
            }
            session.last_results = [first, second];
            *batches_completed += 1;
            session.state = SessionState::Dispatching;
        }
        session.channel.send_sentinel().await?;
        Ok(())
    }
}

pub(crate) fn log_comparison(logger: &Logger, result: &ComparisonResult) {
    match &result.verdict {
        Verdict::Match => debug!(logger, "results match";
            "batch" => result.batch_index, "left" => &result.left, "right" => &result.right),
        Verdict::Divergence { batch_index, a, b } => warn!(logger, "divergence detected";
            "batch" => batch_index,
            "left" => &result.left,
            "right" => &result.right,
            "left_result" => blob_text(a),
            "right_result" => blob_text(b),
            "diff" => render_diff(a, b)),
    }
}
