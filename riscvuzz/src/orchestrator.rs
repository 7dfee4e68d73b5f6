//! Campaign orchestration across boards.
//!
//! The [`FuzzCoordinator`] owns the shared corpus, the board registry and one
//! task per board. Boards progress independently; a failure on one never
//! cancels another. In cross-board mode a single collector task pairs up
//! the per-batch results that the board tasks forward to it.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use slog::{Logger, debug, error, info, o, warn};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{FuzzConfig, Topology};
use crate::dispatcher::{
    BatchDispatcher, BatchReport, BoardOutcome, BoardRun, BoardSession, CrossBoardEvent, log_comparison,
};
use crate::generator::Corpus;
use crate::oracle::ComparisonResult;
use crate::transport::{BoxedStream, FramedChannel, open_serial};

/// Capacity of the channel feeding the cross-board collector.
const REPORT_QUEUE_LEN: usize = 64;

/// The result of a whole campaign.
#[derive(Debug, Clone, Serialize)]
pub struct FuzzReport {
    pub generated_at: DateTime<Utc>,
    pub topology: Topology,
    pub corpus_len: usize,
    pub batch_size: usize,
    pub boards: Vec<BoardOutcome>,
    pub comparisons: Vec<ComparisonResult>,
}

impl FuzzReport {
    pub fn divergences(&self) -> impl Iterator<Item = &ComparisonResult> {
        self.comparisons.iter().filter(|c| !c.is_match())
    }

    pub fn has_divergence(&self) -> bool {
        self.divergences().next().is_some()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Maps board name to the endpoint it was reached through. Entries are added
/// when a board completes its handshake and removed when its session ends.
type Registry = Arc<Mutex<HashMap<String, String>>>;

/// State shared by every board task.
struct Shared {
    config: FuzzConfig,
    corpus: Arc<Corpus>,
    registry: Registry,
    logger: Logger,
}

/// Board tasks and the optional collector of one campaign.
struct Campaign {
    tasks: JoinSet<BoardRun>,
    rejected: Vec<BoardOutcome>,
    reports: Option<mpsc::Sender<CrossBoardEvent>>,
    collector: Option<JoinHandle<Vec<ComparisonResult>>>,
}

impl Campaign {
    /// Records a board that never got a task.
    async fn reject(&mut self, outcome: BoardOutcome) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(CrossBoardEvent::Retired { batches: 0 }).await;
        }
        self.rejected.push(outcome);
    }
}

pub struct FuzzCoordinator {
    shared: Arc<Shared>,
}

impl FuzzCoordinator {
    /// Creates a coordinator for one campaign.
    ///
    /// # Arguments
    ///
    /// * `config` - The validated run configuration.
    /// * `corpus` - The instruction words every board will execute.
    /// * `logger` - Parent logger; each board gets a child logger keyed by its name.
    pub fn new(config: FuzzConfig, corpus: Corpus, logger: Logger) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                corpus: Arc::new(corpus),
                registry: Arc::new(Mutex::new(HashMap::new())),
                logger,
            }),
        }
    }

    pub fn corpus(&self) -> &Corpus {
        &self.shared.corpus
    }

    /// Names of the boards with a live session.
    pub async fn live_boards(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.registry.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs the campaign over already-connected streams, one per board.
    pub async fn run_streams(&self, boards: Vec<(String, BoxedStream)>) -> FuzzReport {
        let mut campaign = self.start(boards.len());
        for (endpoint, stream) in boards {
            self.spawn_board(&mut campaign, endpoint, stream);
        }
        self.finish(campaign).await
    }

    /// Opens every serial device, accepts `expected_tcp` boards on
    /// `listener`, and runs the campaign until every board is done.
    ///
    /// A serial device that cannot be opened, or a TCP connection that
    /// fails to be accepted, is recorded as rejected and the remaining boards
    /// proceed. Only a listener without a local address is an error.
    pub async fn serve(
        &self,
        listener: Option<TcpListener>,
        expected_tcp: usize,
        serial_devices: &[PathBuf],
        baud: u32,
    ) -> anyhow::Result<FuzzReport> {
        let local = match &listener {
            Some(listener) => Some(listener.local_addr().context("listener has no local address")?),
            None => None,
        };
        let expected_tcp = if local.is_some() { expected_tcp } else { 0 };
        let mut campaign = self.start(serial_devices.len() + expected_tcp);
        for device in serial_devices {
            let endpoint = format!("serial:{}", device.display());
            match open_serial(device, baud) {
                Ok(stream) => self.spawn_board(&mut campaign, endpoint, Box::new(stream)),
                Err(err) => {
                    warn!(self.shared.logger, "unable to open serial board";
                        "endpoint" => &endpoint, "error" => %err);
                    campaign.reject(BoardOutcome::rejected(&endpoint, err.to_string())).await;
                }
            }
        }
        if let (Some(listener), Some(local)) = (&listener, local) {
            info!(self.shared.logger, "waiting for boards"; "addr" => %local, "expected" => expected_tcp);
            self.accept_boards(&mut campaign, expected_tcp, move || async move {
                let (stream, peer) = listener.accept().await?;
                // Frames are small and latency-bound.
                let _ = stream.set_nodelay(true);
                Ok::<_, io::Error>((format!("tcp:{peer}"), Box::new(stream) as BoxedStream))
            })
            .await;
        }
        Ok(self.finish(campaign).await)
    }

    /// Takes `expected` connections from `accept`. A failed accept uses up
    /// one slot as a rejected board.
    async fn accept_boards<F, Fut>(&self, campaign: &mut Campaign, expected: usize, mut accept: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<(String, BoxedStream)>>,
    {
        for _ in 0..expected {
            match accept().await {
                Ok((endpoint, stream)) => self.spawn_board(campaign, endpoint, stream),
                Err(err) => {
                    warn!(self.shared.logger, "failed to accept board connection"; "error" => %err);
                    campaign.reject(BoardOutcome::rejected("tcp:?", err.to_string())).await;
                }
            }
        }
    }

    /// `boards` is how many boards the campaign will account for, spawned
    /// or rejected.
    fn start(&self, boards: usize) -> Campaign {
        let (reports, collector) = match self.shared.config.topology {
            Topology::RepeatRun => (None, None),
            Topology::CrossBoard => {
                let (tx, rx) = mpsc::channel(REPORT_QUEUE_LEN);
                let logger = self.shared.logger.new(o!("role" => "collector"));
                (Some(tx), Some(tokio::spawn(collect_cross_board(rx, boards, logger))))
            }
        };
        Campaign {
            tasks: JoinSet::new(),
            rejected: Vec::new(),
            reports,
            collector,
        }
    }

    fn spawn_board(&self, campaign: &mut Campaign, endpoint: String, stream: BoxedStream) {
        let shared = Arc::clone(&self.shared);
        let reports = campaign.reports.clone();
        campaign
            .tasks
            .spawn(async move { run_board(shared, endpoint, stream, reports).await });
    }

    async fn finish(&self, mut campaign: Campaign) -> FuzzReport {
        let mut boards = std::mem::take(&mut campaign.rejected);
        let mut comparisons = Vec::new();
        while let Some(joined) = campaign.tasks.join_next().await {
            match joined {
                Ok(run) => {
                    boards.push(run.outcome);
                    comparisons.extend(run.comparisons);
                }
                Err(err) => error!(self.shared.logger, "board task failed"; "error" => %err),
            }
        }

        // Every board task has dropped its sender by now, so dropping ours
        // lets the collector drain and return.
        drop(campaign.reports.take());
        if let Some(collector) = campaign.collector.take() {
            match collector.await {
                Ok(cross) => comparisons.extend(cross),
                Err(err) => error!(self.shared.logger, "collector task failed"; "error" => %err),
            }
        }
        comparisons.sort_by(|a, b| a.batch_index.cmp(&b.batch_index).then_with(|| a.left.cmp(&b.left)));

        let report = FuzzReport {
            generated_at: Utc::now(),
            topology: self.shared.config.topology,
            corpus_len: self.shared.corpus.len(),
            batch_size: self.shared.config.batch_size,
            boards,
            comparisons,
        };
        info!(self.shared.logger, "campaign finished";
            "boards" => report.boards.len(),
            "comparisons" => report.comparisons.len(),
            "divergences" => report.divergences().count());
        report
    }
}

async fn run_board(
    shared: Arc<Shared>,
    endpoint: String,
    stream: BoxedStream,
    reports: Option<mpsc::Sender<CrossBoardEvent>>,
) -> BoardRun {
    let run = drive_board(shared, endpoint, stream, reports.clone()).await;
    if let Some(reports) = reports {
        let _ = reports
            .send(CrossBoardEvent::Retired {
                batches: run.outcome.batches_completed,
            })
            .await;
    }
    run
}

async fn drive_board(
    shared: Arc<Shared>,
    endpoint: String,
    stream: BoxedStream,
    reports: Option<mpsc::Sender<CrossBoardEvent>>,
) -> BoardRun {
    let logger = shared.logger.new(o!("endpoint" => endpoint.clone()));
    let channel = FramedChannel::new(stream, shared.config.read_timeout, shared.config.max_result_len);
    let mut session = match BoardSession::accept(channel, &endpoint).await {
        Ok(session) => session,
        Err(err) => {
            warn!(logger, "handshake failed"; "error" => %err);
            return BoardRun {
                outcome: BoardOutcome::rejected(&endpoint, err.to_string()),
                comparisons: Vec::new(),
            };
        }
    };

    let name = session.name().to_string();
    match shared.registry.lock().await.entry(name.clone()) {
        Entry::Occupied(existing) => {
            let reason = format!("board name {name:?} already in use by {}", existing.get());
            warn!(logger, "handshake rejected"; "board" => &name, "reason" => &reason);
            let mut outcome = BoardOutcome::rejected(&endpoint, reason);
            outcome.board = name;
            return BoardRun {
                outcome,
                comparisons: Vec::new(),
            };
        }
        Entry::Vacant(slot) => {
            slot.insert(endpoint.clone());
        }
    }
    info!(logger, "board connected"; "board" => &name);

    let dispatcher = BatchDispatcher::new(
        Arc::clone(&shared.corpus),
        shared.config.batch_size,
        shared.config.topology,
        reports,
        logger,
    );
    let run = dispatcher.run(&mut session).await;
    shared.registry.lock().await.remove(&name);
    run
}

/// A batch result waiting for the other boards to report the same batch.
struct PendingBatch {
    reference: BatchReport,
    reported: usize,
}

/// Pairs each forwarded result with the first result seen for the same
/// batch. The first board to report a batch is the reference for it.
///
/// A batch is dropped once no board can still report it: every board has
/// either reported it or retired before reaching it.
struct CrossBoardPairing {
    boards: usize,
    pending: BTreeMap<usize, PendingBatch>,
    retired: Vec<usize>,
}

impl CrossBoardPairing {
    fn new(boards: usize) -> Self {
        Self {
            boards,
            pending: BTreeMap::new(),
            retired: Vec::new(),
        }
    }

    fn record(&mut self, report: BatchReport) -> Option<ComparisonResult> {
        let batch_index = report.batch_index;
        let result = match self.pending.get_mut(&batch_index) {
            None => {
                self.pending.insert(batch_index, PendingBatch { reference: report, reported: 1 });
                None
            }
            Some(pending) => {
                pending.reported += 1;
                let first = &pending.reference;
                Some(ComparisonResult::new(
                    batch_index,
                    &first.board,
                    &report.board,
                    &first.blob,
                    &report.blob,
                ))
            }
        };
        self.settle(batch_index);
        result
    }

    /// A board left after forwarding batches `0..batches`.
    fn retire(&mut self, batches: usize) {
        self.retired.push(batches);
        let open: Vec<usize> = self.pending.range(batches..).map(|(&index, _)| index).collect();
        for index in open {
            self.settle(index);
        }
    }

    fn settle(&mut self, batch_index: usize) {
        let Some(pending) = self.pending.get(&batch_index) else {
            return;
        };
        let never = self.retired.iter().filter(|&&batches| batches <= batch_index).count();
        if pending.reported + never >= self.boards {
            self.pending.remove(&batch_index);
        }
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}

async fn collect_cross_board(
    mut rx: mpsc::Receiver<CrossBoardEvent>,
    boards: usize,
    logger: Logger,
) -> Vec<ComparisonResult> {
    let mut pairing = CrossBoardPairing::new(boards);
    let mut results = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            CrossBoardEvent::Result(report) => {
                if let Some(result) = pairing.record(report) {
                    log_comparison(&logger, &result);
                    results.push(result);
                }
            }
            CrossBoardEvent::Retired { batches } => pairing.retire(batches),
        }
    }
    if pairing.pending() > 0 {
        debug!(logger, "batches left unpaired"; "count" => pairing.pending());
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_MAX_RESULT_LEN;
    use crate::dispatcher::SessionEnd;
    use assert_matches::assert_matches;
    use tokio::io::{DuplexStream, duplex};

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    async fn echo_board(stream: DuplexStream, name: &'static str) {
        let mut board = FramedChannel::new(stream, None, DEFAULT_MAX_RESULT_LEN);
        if board.send_handshake(name).await.is_err() {
            return;
        }
        while let Ok(Some(batch)) = board.recv_batch().await {
            let blob = format!("{batch:x?}").into_bytes();
            if board.send_result(&blob).await.is_err() || board.send_result(&blob).await.is_err() {
                return;
            }
        }
    }

    fn connect(name: &'static str) -> (String, BoxedStream) {
        let (host, board) = duplex(1 << 16);
        tokio::spawn(echo_board(board, name));
        (format!("duplex:{name}"), Box::new(host))
    }

    #[tokio::test]
    async fn every_board_runs_the_whole_corpus() {
        let config = FuzzConfig {
            batch_size: 3,
            ..FuzzConfig::default()
        };
        let coordinator = FuzzCoordinator::new(config, Corpus::new(vec![0x13; 10]), logger());
        let report = coordinator
            .run_streams(vec![connect("a"), connect("b"), connect("c")])
            .await;

        assert_eq!(report.boards.len(), 3);
        for board in &report.boards {
            assert_eq!(board.end, SessionEnd::Completed);
            assert_eq!(board.batches_completed, 4);
        }
        assert_eq!(report.comparisons.len(), 12);
        assert!(!report.has_divergence());
        assert!(coordinator.live_boards().await.is_empty());
    }

    /// A board that takes its first batch and then goes silent, keeping its
    /// name registered until the read timeout fires.
    fn stalled(name: &'static str) -> (String, BoxedStream) {
        let (host, board) = duplex(1 << 16);
        tokio::spawn(async move {
            let mut board = FramedChannel::new(board, None, DEFAULT_MAX_RESULT_LEN);
            board.send_handshake(name).await.unwrap();
            let _ = board.recv_batch().await;
            std::future::pending::<()>().await;
        });
        (format!("duplex:{name}"), Box::new(host))
    }

    #[tokio::test]
    async fn duplicate_names_reject_only_the_latecomer() {
        let config = FuzzConfig {
            read_timeout: Some(std::time::Duration::from_millis(200)),
            ..FuzzConfig::default()
        };
        let coordinator = FuzzCoordinator::new(config, Corpus::new(vec![0x13]), logger());
        let report = coordinator
            .run_streams(vec![stalled("twin"), stalled("twin")])
            .await;

        assert_eq!(report.boards.len(), 2);
        let rejected = report
            .boards
            .iter()
            .filter(|b| matches!(b.end, SessionEnd::Rejected(_)))
            .count();
        let timed_out = report
            .boards
            .iter()
            .filter(|b| matches!(b.end, SessionEnd::Disconnected(_)))
            .count();
        assert_eq!((rejected, timed_out), (1, 1));
        assert!(report.boards.iter().all(|b| b.board == "twin"));
    }

    #[tokio::test]
    async fn failed_handshake_is_isolated() {
        let (host, board) = duplex(64);
        drop(board);
        let coordinator = FuzzCoordinator::new(FuzzConfig::default(), Corpus::new(vec![0x13]), logger());
        let report = coordinator
            .run_streams(vec![("duplex:dead".to_string(), Box::new(host) as BoxedStream), connect("alive")])
            .await;

        let dead = report.boards.iter().find(|b| b.endpoint == "duplex:dead").unwrap();
        assert_matches!(dead.end, SessionEnd::Rejected(_));
        let alive = report.boards.iter().find(|b| b.board == "alive").unwrap();
        assert_eq!(alive.end, SessionEnd::Completed);
    }

    #[tokio::test]
    async fn report_serializes() {
        let coordinator = FuzzCoordinator::new(FuzzConfig::default(), Corpus::new(vec![0x13]), logger());
        let report = coordinator.run_streams(vec![connect("solo")]).await;
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        let generated_at = json["generated_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(generated_at).is_ok(), "{generated_at}");
        assert_eq!(json["topology"], "repeat_run");
        assert_eq!(json["boards"][0]["end"]["status"], "completed");
        assert_eq!(json["comparisons"][0]["verdict"], "match");
    }

    #[tokio::test]
    async fn failed_accept_does_not_stop_running_boards() {
        let config = FuzzConfig {
            topology: Topology::CrossBoard,
            ..FuzzConfig::default()
        };
        let coordinator = FuzzCoordinator::new(config, Corpus::new(vec![0x13; 4]), logger());
        let mut campaign = coordinator.start(3);
        let (endpoint, stream) = connect("early");
        coordinator.spawn_board(&mut campaign, endpoint, stream);

        let mut script = vec![
            Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            Ok(connect("late")),
        ]
        .into_iter();
        coordinator
            .accept_boards(&mut campaign, 2, || {
                let next = script.next().unwrap();
                async move { next }
            })
            .await;
        let report = coordinator.finish(campaign).await;

        assert_eq!(report.boards.len(), 3);
        let failed = report.boards.iter().find(|b| b.endpoint == "tcp:?").unwrap();
        assert_matches!(failed.end, SessionEnd::Rejected(_));
        for name in ["early", "late"] {
            let board = report.boards.iter().find(|b| b.board == name).unwrap();
            assert_eq!(board.end, SessionEnd::Completed);
        }
        let cross: Vec<_> = report.comparisons.iter().filter(|c| c.left != c.right).collect();
        assert_eq!(cross.len(), 1);
        assert!(cross[0].is_match());
    }

    fn batch(board: &str, batch_index: usize, blob: &[u8]) -> BatchReport {
        BatchReport {
            board: board.to_string(),
            batch_index,
            blob: blob.to_vec(),
        }
    }

    #[test]
    fn pairing_forgets_batches_every_board_has_reported() {
        let mut pairing = CrossBoardPairing::new(3);
        assert!(pairing.record(batch("a", 0, b"r0")).is_none());
        let second = pairing.record(batch("b", 0, b"r0")).unwrap();
        assert!(second.is_match());
        assert_eq!(pairing.pending(), 1);

        let third = pairing.record(batch("c", 0, b"other")).unwrap();
        assert_eq!((third.left.as_str(), third.right.as_str()), ("a", "c"));
        assert!(!third.is_match());
        assert_eq!(pairing.pending(), 0);
    }

    #[test]
    fn pairing_forgets_batches_retired_boards_never_reach() {
        let mut pairing = CrossBoardPairing::new(2);
        pairing.record(batch("a", 0, b"r0"));
        pairing.record(batch("a", 1, b"r1"));
        pairing.record(batch("a", 2, b"r2"));
        assert_eq!(pairing.pending(), 3);

        // "b" dropped out after one batch: only its batch 0 can still arrive.
        pairing.retire(1);
        assert_eq!(pairing.pending(), 1);
        assert!(pairing.record(batch("b", 0, b"r0")).unwrap().is_match());
        assert_eq!(pairing.pending(), 0);
    }

    #[test]
    fn pairing_waits_for_boards_that_join_late() {
        let mut pairing = CrossBoardPairing::new(2);
        pairing.record(batch("a", 0, b"r0"));
        pairing.record(batch("a", 1, b"r1"));
        pairing.retire(2);
        assert_eq!(pairing.pending(), 2);

        assert!(pairing.record(batch("b", 0, b"r0")).unwrap().is_match());
        assert!(!pairing.record(batch("b", 1, b"x")).unwrap().is_match());
        assert_eq!(pairing.pending(), 0);
    }
}
