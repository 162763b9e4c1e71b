// THEORY:
// The `parallel_pipeline` module runs many images at once. Two levels of parallelism
// are in play:
// - Batch level (this module): a fixed `WorkerPool` of async worker tasks, one per
//   execution unit, pulls image paths from a bounded queue. Each image runs on the
//   blocking thread pool so CPU-heavy decoding and analysis never stall the runtime.
// - Image level (`image_analyzer`): each image's row-blocks fan out on rayon.
//
// Workers share nothing mutable except the `StatisticsTable`, which serialises its
// own appends, and the event channel, which tolerates concurrent senders. Every
// submitted image yields exactly one `ProgressEvent`, in completion order. A failure
// in one image becomes a failed event for that image and the batch keeps going.
//
// A timed-out image is abandoned through its `OutputClaim`, so it leaves no rows and
// no annotated copy behind. Its blocking task cannot be interrupted. The worker
// keeps the handle and waits for it before finishing, so nothing touches the output
// directory after `Completed`.
//
// Lifecycle:
//   setup    validate config, create output dir, truncate and re-header the table.
//            A failure here is fatal, reported once, before any worker starts.
//   submit   feed paths into the queue. Submission stops at the first sign of
//            cancellation, and images already queued still run.
//   drain    close the queue, wait for every worker, total their tallies.
//   finish   emit `BatchEvent::Completed` with the summary.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BatchConfig;
use crate::core_modules::image_analyzer::ImageResult;
use crate::core_modules::statistics_table::StatisticsTable;
use crate::error::{Result, SpotError};
use crate::pipeline::{ImageProcessor, OutputClaim, image_name};

/// How one image ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed { object_count: usize },
    Failed { error: String },
}

/// Status of a single finished image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub image_name: String,
    pub outcome: Outcome,
}

impl ProgressEvent {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Processed { .. })
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Processed { object_count } => {
                write!(f, "Processed: {}, objects found: {object_count}", self.image_name)
            }
            Outcome::Failed { error } => write!(f, "Failed: {}, {error}", self.image_name),
        }
    }
}

/// Totals for a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Cancellation was observed before every image had been submitted.
    pub cancelled: bool,
}

/// Everything the dispatcher tells its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    Progress(ProgressEvent),
    Completed(BatchSummary),
    /// The batch could not start. Sent at most once, and never after a `Progress`.
    Failed(String),
}

pub type EventSender = mpsc::UnboundedSender<BatchEvent>;

/// Cooperative cancellation signal shared between the shell and the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Images a worker (or the whole pool) finished, split by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerTally {
    pub succeeded: usize,
    pub failed: usize,
}

/// Fixed-size pool of image workers fed by one bounded queue.
pub struct WorkerPool {
    task_sender: mpsc::Sender<PathBuf>,
    workers: Vec<JoinHandle<WorkerTally>>,
}

impl WorkerPool {
    /// Spawns `worker_count` workers. Must be called inside a tokio runtime.
    pub fn new(
        worker_count: usize,
        processor: Arc<ImageProcessor>,
        events: EventSender,
        per_image_timeout: Option<Duration>,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, task_receiver) = mpsc::channel::<PathBuf>(worker_count);
        let task_receiver = Arc::new(Mutex::new(task_receiver));

        let workers = (0..worker_count)
            .map(|worker_id| {
                let receiver = Arc::clone(&task_receiver);
                let processor = Arc::clone(&processor);
                let events = events.clone();
                tokio::spawn(async move {
                    let mut tally = WorkerTally::default();
                    let mut abandoned = Vec::new();
                    loop {
                        // Hold the lock only while waiting for the next path.
                        let next = receiver.lock().await.recv().await;
                        let Some(path) = next else { break };

                        let (event, runaway) =
                            Self::process_image(&processor, path, per_image_timeout).await;
                        abandoned.extend(runaway);
                        if event.is_success() {
                            tally.succeeded += 1;
                        } else {
                            tally.failed += 1;
                        }
                        // A dropped receiver only means nobody is listening any more.
                        let _ = events.send(BatchEvent::Progress(event));
                    }
                    if !abandoned.is_empty() {
                        debug!(worker_id, count = abandoned.len(), "waiting for abandoned images");
                        join_all(abandoned).await;
                    }
                    debug!(worker_id, succeeded = tally.succeeded, failed = tally.failed, "worker finished");
                    tally
                })
            })
            .collect();

        Self {
            task_sender,
            workers,
        }
    }

    /// Runs one image to completion or timeout. A timed-out image comes back with
    /// the handle of its still-running task.
    async fn process_image(
        processor: &Arc<ImageProcessor>,
        path: PathBuf,
        per_image_timeout: Option<Duration>,
    ) -> (ProgressEvent, Option<JoinHandle<Result<ImageResult>>>) {
        let name = image_name(&path);
        let processor = Arc::clone(processor);
        let claim = Arc::new(OutputClaim::new());
        let mut task = tokio::task::spawn_blocking({
            let claim = Arc::clone(&claim);
            move || processor.process_claimed(&path, &claim)
        });

        let joined = match per_image_timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, &mut task).await;
                match waited {
                    Ok(joined) => joined,
                    Err(_) if claim.abandon() => {
                        return (failed(name, SpotError::Timeout(limit)), Some(task));
                    }
                    // Already committed its rows; let it finish.
                    Err(_) => task.await,
                }
            }
            None => task.await,
        };

        let event = match joined {
            Ok(Ok(result)) => ProgressEvent {
                image_name: name,
                outcome: Outcome::Processed {
                    object_count: result.object_count(),
                },
            },
            Ok(Err(err)) => failed(name, err),
            Err(join_err) => failed(name, SpotError::Worker(join_err.to_string())),
        };
        (event, None)
    }

    /// Queues one image, waiting while the queue is full.
    pub async fn submit(&self, path: PathBuf) -> Result<()> {
        self.task_sender
            .send(path)
            .await
            .map_err(|_| SpotError::Worker("worker pool has shut down".to_string()))
    }

    /// Closes the queue and waits for every worker to finish what it has.
    pub async fn drain(self) -> WorkerTally {
        drop(self.task_sender);
        let mut total = WorkerTally::default();
        for joined in join_all(self.workers).await {
            match joined {
                Ok(tally) => {
                    total.succeeded += tally.succeeded;
                    total.failed += tally.failed;
                }
                Err(err) => warn!(error = %err, "image worker task ended abnormally"),
            }
        }
        total
    }
}

fn failed(image_name: String, err: SpotError) -> ProgressEvent {
    warn!(image = %image_name, error = %err, "image failed");
    ProgressEvent {
        image_name,
        outcome: Outcome::Failed {
            error: err.to_string(),
        },
    }
}

/// Runs the per-image pipeline over a whole batch.
pub struct BatchDispatcher {
    config: BatchConfig,
}

impl BatchDispatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Processes every configured image and reports through `events`.
    ///
    /// Returns `Err` only when setup fails. Per-image failures are reported as
    /// events and counted in the summary.
    pub async fn run(&self, events: EventSender, cancel: CancelFlag) -> Result<BatchSummary> {
        let table = match self.setup() {
            Ok(table) => table,
            Err(err) => {
                let _ = events.send(BatchEvent::Failed(err.to_string()));
                return Err(err);
            }
        };

        let config = &self.config;
        info!(
            images = config.image_paths.len(),
            workers = config.worker_count,
            blocks = config.block_count,
            output = %config.output_dir.display(),
            "batch started"
        );

        let processor = Arc::new(ImageProcessor::new(
            config.analysis,
            config.block_count,
            config.output_dir.clone(),
            table,
        ));
        let pool = WorkerPool::new(
            config.worker_count,
            processor,
            events.clone(),
            config.per_image_timeout,
        );

        let mut summary = BatchSummary::default();
        for path in &config.image_paths {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                info!(submitted = summary.submitted, "cancellation observed, no further images submitted");
                break;
            }
            if let Err(err) = pool.submit(path.clone()).await {
                warn!(error = %err, "stopped submitting images");
                break;
            }
            summary.submitted += 1;
        }

        let tally = pool.drain().await;
        summary.succeeded = tally.succeeded;
        summary.failed = tally.failed;

        info!(
            submitted = summary.submitted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "batch finished"
        );
        let _ = events.send(BatchEvent::Completed(summary));
        Ok(summary)
    }

    fn setup(&self) -> Result<Arc<StatisticsTable>> {
        self.config.validate()?;
        std::fs::create_dir_all(&self.config.output_dir)
            .map_err(|e| SpotError::io(&self.config.output_dir, e))?;
        Ok(Arc::new(StatisticsTable::create(&self.config.output_dir)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::core_modules::statistics_table::STATISTICS_FILE_NAME;
    use image::{GrayImage, Luma};
    use std::collections::HashSet;
    use std::path::Path;

    fn sharp() -> AnalysisConfig {
        AnalysisConfig {
            blur_sigma: 0.1,
            ..AnalysisConfig::default()
        }
    }

    /// `count` isolated bright pixels on a diagonal-ish grid, well apart.
    fn write_dotted_image(path: &Path, count: u32) {
        let mut image = GrayImage::new(64, 64);
        for i in 0..count {
            image.put_pixel(3 + (i % 8) * 7, 3 + (i / 8) * 7, Luma([200 + (i % 50) as u8]));
        }
        image.save(path).unwrap();
    }

    /// A square frame with one bright square in the middle, slow to smooth at large sigma.
    fn write_square_image(path: &Path, side: u32) {
        let (low, high) = (side / 3, 2 * side / 3);
        let image = GrayImage::from_fn(side, side, |x, y| {
            let inside = (low..high).contains(&x) && (low..high).contains(&y);
            Luma([if inside { 220 } else { 10 }])
        });
        image.save(path).unwrap();
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<BatchEvent>) -> Vec<BatchEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn progress(events: &[BatchEvent]) -> Vec<&ProgressEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn progress_lines_are_human_readable() {
        let ok = ProgressEvent {
            image_name: "a.png".to_string(),
            outcome: Outcome::Processed { object_count: 3 },
        };
        let bad = ProgressEvent {
            image_name: "b.png".to_string(),
            outcome: Outcome::Failed {
                error: "boom".to_string(),
            },
        };
        assert_eq!(ok.to_string(), "Processed: a.png, objects found: 3");
        assert_eq!(bad.to_string(), "Failed: b.png, boom");
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_missing_image_does_not_stop_the_batch() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let first = input.path().join("first.png");
        let third = input.path().join("third.png");
        write_dotted_image(&first, 3);
        write_dotted_image(&third, 5);
        let paths = vec![first, input.path().join("missing.png"), third];

        let config = BatchConfig::new(paths, output.path())
            .with_analysis(sharp())
            .with_worker_count(2)
            .with_block_count(2);
        let (tx, rx) = mpsc::unbounded_channel();
        let summary = BatchDispatcher::new(config).run(tx, CancelFlag::new()).await.unwrap();
        let events = collect(rx).await;

        let progress = progress(&events);
        assert_eq!(progress.len(), 3);
        assert_eq!(progress.iter().filter(|p| p.is_success()).count(), 2);
        let failure = progress.iter().find(|p| !p.is_success()).unwrap();
        assert_eq!(failure.image_name, "missing.png");
        assert!(failure.to_string().starts_with("Failed: missing.png, "));

        assert_eq!(events.last(), Some(&BatchEvent::Completed(summary)));
        assert_eq!(
            summary,
            BatchSummary {
                submitted: 3,
                succeeded: 2,
                failed: 1,
                cancelled: false
            }
        );

        let table = std::fs::read_to_string(output.path().join(STATISTICS_FILE_NAME)).unwrap();
        let rows: Vec<&str> = table.lines().skip(1).collect();
        assert_eq!(rows.len(), 3 + 5);
        assert!(rows.iter().all(|r| !r.starts_with("missing.png")));
        assert!(output.path().join("first_processed.png").exists());
        assert!(output.path().join("third_processed.png").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_write_every_row_exactly_once() {
        const IMAGES: usize = 12;
        const BLOBS: u32 = 20;

        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..IMAGES)
            .map(|i| {
                let path = input.path().join(format!("img{i:02}.png"));
                write_dotted_image(&path, BLOBS);
                path
            })
            .collect();

        let config = BatchConfig::new(paths, output.path())
            .with_analysis(sharp())
            .with_worker_count(4)
            .with_block_count(3);
        let (tx, rx) = mpsc::unbounded_channel();
        let summary = BatchDispatcher::new(config).run(tx, CancelFlag::new()).await.unwrap();
        let events = collect(rx).await;

        assert_eq!(summary.succeeded, IMAGES);
        assert_eq!(progress(&events).len(), IMAGES);
        assert!(progress(&events).iter().all(|p| p.outcome == Outcome::Processed { object_count: BLOBS as usize }));

        let table = std::fs::read_to_string(output.path().join(STATISTICS_FILE_NAME)).unwrap();
        let mut lines = table.lines();
        assert_eq!(lines.next(), Some("Image,X Center,Y Center,Width,Height,Size,Brightness"));

        let rows: Vec<&str> = lines.collect();
        assert_eq!(rows.len(), IMAGES * BLOBS as usize);
        let unique: HashSet<&str> = rows.iter().copied().collect();
        assert_eq!(unique.len(), rows.len(), "duplicated rows");
        for row in &rows {
            let fields: Vec<&str> = row.split(',').collect();
            assert_eq!(fields.len(), 7, "malformed row: {row}");
            assert!(fields[0].starts_with("img") && fields[0].ends_with(".png"));
            assert_eq!(&fields[3..6], &["1", "1", "1"]);
        }
    }

    #[tokio::test]
    async fn cancelled_batch_submits_nothing_new() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let path = input.path().join("a.png");
        write_dotted_image(&path, 1);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let config = BatchConfig::new(vec![path.clone(), path], output.path()).with_worker_count(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let summary = BatchDispatcher::new(config).run(tx, cancel).await.unwrap();
        let events = collect(rx).await;

        assert!(summary.cancelled);
        assert_eq!(summary.submitted, 0);
        assert!(progress(&events).is_empty());
        assert_eq!(events, vec![BatchEvent::Completed(summary)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_mid_batch_stops_submission() {
        const IMAGES: usize = 16;

        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..IMAGES)
            .map(|i| {
                let path = input.path().join(format!("square{i:02}.png"));
                write_square_image(&path, 256);
                path
            })
            .collect();

        let config = BatchConfig::new(paths, output.path())
            .with_analysis(AnalysisConfig {
                blur_sigma: 2.0,
                ..AnalysisConfig::default()
            })
            .with_worker_count(1)
            .with_block_count(1);
        let cancel = CancelFlag::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batch = tokio::spawn({
            let cancel = cancel.clone();
            async move { BatchDispatcher::new(config).run(tx, cancel).await }
        });

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if matches!(event, BatchEvent::Progress(_)) {
                cancel.cancel();
            }
            events.push(event);
        }
        let summary = batch.await.unwrap().unwrap();

        assert!(summary.cancelled);
        assert!(summary.submitted < IMAGES, "submitted {}", summary.submitted);
        assert_eq!(progress(&events).len(), summary.submitted);
        assert_eq!(summary.succeeded, summary.submitted);
        assert_eq!(events.last(), Some(&BatchEvent::Completed(summary)));

        let table = std::fs::read_to_string(output.path().join(STATISTICS_FILE_NAME)).unwrap();
        assert_eq!(table.lines().count(), 1 + summary.submitted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_image_leaves_no_output() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let path = input.path().join("slow.png");
        write_square_image(&path, 600);

        let config = BatchConfig::new(vec![path], output.path())
            .with_analysis(AnalysisConfig {
                blur_sigma: 6.0,
                ..AnalysisConfig::default()
            })
            .with_worker_count(1)
            .with_block_count(1)
            .with_per_image_timeout(Some(Duration::from_millis(1)));
        let (tx, rx) = mpsc::unbounded_channel();
        let summary = BatchDispatcher::new(config).run(tx, CancelFlag::new()).await.unwrap();
        let events = collect(rx).await;

        let progress = progress(&events);
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].image_name, "slow.png");
        assert!(progress[0].to_string().contains("timed out"), "{}", progress[0]);
        assert_eq!(
            summary,
            BatchSummary {
                submitted: 1,
                succeeded: 0,
                failed: 1,
                cancelled: false
            }
        );

        // The abandoned task has finished by the time `run` returns.
        let table = std::fs::read_to_string(output.path().join(STATISTICS_FILE_NAME)).unwrap();
        assert_eq!(table.lines().count(), 1);
        assert!(!output.path().join("slow_processed.png").exists());
    }

    #[tokio::test]
    async fn setup_failure_is_reported_once_and_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the output directory should be.
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, b"").unwrap();

        let config = BatchConfig::new(vec![dir.path().join("a.png")], &blocker);
        let (tx, rx) = mpsc::unbounded_channel();
        let result = BatchDispatcher::new(config).run(tx, CancelFlag::new()).await;
        let events = collect(rx).await;

        assert!(matches!(result, Err(SpotError::Io { .. })));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BatchEvent::Failed(_)));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_touching_the_output() {
        let output = tempfile::tempdir().unwrap();
        let config = BatchConfig::new(Vec::new(), output.path()).with_block_count(0);
        let (tx, rx) = mpsc::unbounded_channel();
        let result = BatchDispatcher::new(config).run(tx, CancelFlag::new()).await;

        assert!(matches!(result, Err(SpotError::InvalidParameter { name: "block_count", .. })));
        assert!(!output.path().join(STATISTICS_FILE_NAME).exists());
        assert_eq!(collect(rx).await.len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_still_writes_header_and_completes() {
        let output = tempfile::tempdir().unwrap();
        let config = BatchConfig::new(Vec::new(), output.path());
        let (tx, rx) = mpsc::unbounded_channel();
        let summary = BatchDispatcher::new(config).run(tx, CancelFlag::new()).await.unwrap();

        assert_eq!(summary, BatchSummary::default());
        assert_eq!(collect(rx).await, vec![BatchEvent::Completed(summary)]);
        let table = std::fs::read_to_string(output.path().join(STATISTICS_FILE_NAME)).unwrap();
        assert_eq!(table.lines().count(), 1);
    }
}
