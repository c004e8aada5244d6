//! 提取流水线
//!
//! 一个解码生产者 + N 个分析工作线程（rayon 线程池），调用线程运行选择器。
//! 分析结果按准入序号重排后串行送入选择器，保证缓存窗口有唯一的全局顺序。

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::core::config::ExtractorConfig;
use crate::core::error::{FrameFailure, KeyframeError, Result, RunError};
use crate::core::video::{
    DefaultScorer, FrameMetadata, FrameScorer, FrameSource, FrameWriter, ImageFileWriter,
    VideoMetadata,
};
use crate::frame_extractor::analyzer::{AnalyzerSettings, FrameAnalyzer, PreparedFrame};
use crate::frame_extractor::buffer::{FrameBuffer, Rejected, SlotLease};
use crate::frame_extractor::inference::ThresholdEstimate;
use crate::frame_extractor::resilience::{RetryPolicy, MAX_CONSECUTIVE_FAILURES};
use crate::frame_extractor::state_machine::{Keyframe, KeyframeSelector};

/// How long blocked producers and workers wait before re-checking for
/// cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const REPORT_FILE_NAME: &str = "report.json";

/// 运行级取消标志；在帧之间检查，已在处理的帧会完成
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
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

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub processed: u64,
    pub kept: u64,
    pub skipped: u64,
    /// `None` when the frame count is unknown.
    pub fraction: Option<f32>,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct KeyframeRecord {
    pub index: u64,
    pub timestamp_ms: u64,
    pub quality_composite: f32,
    pub motion_score: f32,
    pub similarity_to_cache: f32,
    pub metadata: FrameMetadata,
    pub path: PathBuf,
}

/// 运行结果统计；失败时同样返回（包含在 RunError 中）
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub video: Option<VideoMetadata>,
    pub processed: u64,
    pub kept: u64,
    pub rejected: u64,
    pub skipped_on_error: u64,
    pub retries: u32,
    pub elapsed_ms: u64,
    pub keyframes_enabled: bool,
    pub similarity_threshold: f32,
    pub inference: Option<ThresholdEstimate>,
    /// Why the output set is incomplete, if it is.
    pub truncated: Option<String>,
    pub failures: Vec<FrameFailure>,
    pub keyframes: Vec<KeyframeRecord>,
}

impl RunSummary {
    fn progress(&self, frame_count: Option<u64>) -> ProgressUpdate {
        ProgressUpdate {
            processed: self.processed,
            kept: self.kept,
            skipped: self.skipped_on_error,
            fraction: frame_count
                .filter(|&n| n > 0)
                .map(|n| (self.processed as f32 / n as f32).min(1.0)),
        }
    }
}

/// Analysis outcome for one admitted frame, sent from a worker to the selector.
struct WorkerOutput {
    seq: u64,
    index: u64,
    outcome: Result<PreparedFrame>,
    /// Held until the selector has decided the frame.
    _lease: SlotLease,
}

/// What the producer observed, read by the selector once the scope ends.
#[derive(Default)]
struct ProducerReport {
    read: u64,
    retries: u32,
    failures: Vec<FrameFailure>,
    fatal: Option<(KeyframeError, u64)>,
    truncated: Option<(KeyframeError, String)>,
}

pub struct FrameExtractor {
    config: ExtractorConfig,
    scorer: Arc<dyn FrameScorer>,
    writer: Arc<dyn FrameWriter>,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
    inference: Option<ThresholdEstimate>,
}

impl FrameExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config,
            scorer: Arc::new(DefaultScorer::new()),
            writer: Arc::new(ImageFileWriter::new()),
            cancel: CancelToken::new(),
            progress: None,
            inference: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn FrameScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn FrameWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// 使用推断出的阈值，并记入运行报告
    pub fn with_inferred_threshold(mut self, estimate: ThresholdEstimate) -> Self {
        self.config.similarity_threshold = estimate.threshold;
        self.inference = Some(estimate);
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn analyzer(&self) -> FrameAnalyzer {
        FrameAnalyzer::new(
            Arc::clone(&self.scorer),
            AnalyzerSettings::from_config(&self.config),
        )
    }

    pub fn run(
        &self,
        source: &mut dyn FrameSource,
        output_dir: &Path,
    ) -> std::result::Result<RunSummary, RunError> {
        let start = Instant::now();
        let config = &self.config;
        config.validate().map_err(RunError::before_start)?;
        std::fs::create_dir_all(output_dir)
            .map_err(|e| RunError::before_start(KeyframeError::Io(e)))?;

        let workers = config.worker_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers + 1)
            .thread_name(|i| format!("keyframe-{}", i))
            .build()
            .map_err(|e| RunError::before_start(KeyframeError::Config(e.to_string())))?;

        let metadata = source.metadata().clone();
        let frame_count = metadata.frame_count;
        info!(
            "🎬 Extraction started: {}x{} @ {:.2} fps, {} frames, {} workers, keyframes {}",
            metadata.width,
            metadata.height,
            metadata.fps,
            frame_count.map_or_else(|| "?".to_string(), |n| n.to_string()),
            workers,
            if config.enable_keyframes { "on" } else { "off" }
        );

        let mut summary = RunSummary {
            video: Some(metadata),
            keyframes_enabled: config.enable_keyframes,
            similarity_threshold: config.similarity_threshold,
            inference: self.inference.clone(),
            ..Default::default()
        };

        let analyzer = self.analyzer();
        let mut selector = if config.enable_keyframes {
            KeyframeSelector::new(analyzer.clone(), config.cache_size, config.burst_frames)
        } else {
            KeyframeSelector::full_extraction(analyzer.clone())
        };
        let policy = RetryPolicy::from_config(&config.retry);
        let buffer = FrameBuffer::new(config.buffer_size, config.max_memory_bytes());
        let stop = AtomicBool::new(false);
        let report = Mutex::new(ProducerReport::default());
        let mut write_retries = 0u32;
        let mut timed_out = false;

        let (tx, rx) = mpsc::channel::<WorkerOutput>();

        pool.in_place_scope(|scope| {
            {
                let buffer = buffer.clone();
                let (policy, stop, report) = (&policy, &stop, &report);
                let cancel = &self.cancel;
                let video_timeout = config.retry.video_timeout();
                scope.spawn(move |_| {
                    let outcome = produce(source, &buffer, policy, || {
                        if cancel.is_cancelled() {
                            Some((KeyframeError::Cancelled, "cancelled".to_string()))
                        } else if stop.load(Ordering::SeqCst) || start.elapsed() >= video_timeout {
                            Some((
                                KeyframeError::Timeout(video_timeout),
                                format!("video timeout of {:?} exceeded", video_timeout),
                            ))
                        } else {
                            None
                        }
                    });
                    buffer.close();
                    *report.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
                });
            }

            for _ in 0..workers {
                let buffer = buffer.clone();
                let tx = tx.clone();
                let analyzer = &analyzer;
                scope.spawn(move |_| analyze_worker(&buffer, analyzer, &tx));
            }
            drop(tx);

            // 按准入序号重排后串行决策
            let mut reorder: BTreeMap<u64, WorkerOutput> = BTreeMap::new();
            let mut next_seq = 0u64;
            for output in rx.iter() {
                reorder.insert(output.seq, output);
                while let Some(output) = reorder.remove(&next_seq) {
                    next_seq += 1;
                    write_retries +=
                        self.decide(&mut selector, output, output_dir, &policy, &mut summary);
                    self.report_progress(&summary, frame_count);

                    if !timed_out && start.elapsed() >= config.retry.video_timeout() {
                        timed_out = true;
                        stop.store(true, Ordering::SeqCst);
                        warn!("⏱️ Video timeout reached, draining in-flight frames");
                    }
                }
            }

            if !reorder.is_empty() {
                warn!("⚠️ {} analysis results arrived out of sequence", reorder.len());
                for (_, output) in std::mem::take(&mut reorder) {
                    write_retries +=
                        self.decide(&mut selector, output, output_dir, &policy, &mut summary);
                }
            }
        });

        for keyframe in selector.finish() {
            write_retries += self.emit(keyframe, output_dir, &policy, &mut summary);
        }

        let producer = report.into_inner().unwrap_or_else(PoisonError::into_inner);
        summary.processed += producer.failures.len() as u64;
        summary.skipped_on_error += producer.failures.len() as u64;
        summary.failures.extend(producer.failures);
        summary.retries = producer.retries + write_retries;
        summary.rejected = summary
            .processed
            .saturating_sub(summary.kept + summary.skipped_on_error);
        summary.elapsed_ms = start.elapsed().as_millis() as u64;

        let run_error = if let Some((source_error, index)) = producer.fatal {
            error!("❌ Aborting at frame {}: {}", index, source_error);
            summary.truncated = Some(format!("aborted at frame {}: {}", index, source_error));
            Some((source_error, Some(index)))
        } else if let Some((reason, message)) = producer.truncated {
            warn!("⚠️ Output truncated after {} frames: {}", producer.read, message);
            summary.truncated = Some(message);
            Some((reason, Some(producer.read)))
        } else {
            None
        };

        if summary.skipped_on_error > 0 {
            warn!("⚠️ {} frames skipped on error", summary.skipped_on_error);
        }
        if config.write_report {
            if let Err(e) = write_report(&summary, output_dir) {
                warn!("⚠️ Failed to write {}: {}", REPORT_FILE_NAME, e);
            }
        }

        info!(
            "✅ Extraction finished: processed {}, kept {}, rejected {}, skipped {} in {} ms",
            summary.processed,
            summary.kept,
            summary.rejected,
            summary.skipped_on_error,
            summary.elapsed_ms
        );

        match run_error {
            Some((source, frame_index)) => Err(RunError {
                source,
                frame_index,
                elapsed: start.elapsed(),
                retries: summary.retries,
                summary,
            }),
            None => Ok(summary),
        }
    }

    /// Feeds one in-order worker output to the selector; returns write retries.
    fn decide(
        &self,
        selector: &mut KeyframeSelector,
        output: WorkerOutput,
        output_dir: &Path,
        policy: &RetryPolicy,
        summary: &mut RunSummary,
    ) -> u32 {
        let WorkerOutput {
            index,
            outcome,
            _lease: lease,
            ..
        } = output;

        let verdict = match outcome {
            Ok(prepared) => match selector.process(prepared) {
                Ok(verdict) => verdict,
                Err(e) => selector.process_failure(index, e),
            },
            Err(e) => selector.process_failure(index, e),
        };
        // 决策完成，释放缓冲预留
        drop(lease);

        summary.processed += 1;
        if let Some(e) = &verdict.error {
            summary.skipped_on_error += 1;
            summary.failures.push(FrameFailure::new(Some(index), e));
        }

        verdict
            .ready
            .into_iter()
            .map(|keyframe| self.emit(keyframe, output_dir, policy, summary))
            .sum()
    }

    /// 写出关键帧；重试耗尽后跳过并记录
    fn emit(
        &self,
        keyframe: Keyframe,
        output_dir: &Path,
        policy: &RetryPolicy,
        summary: &mut RunSummary,
    ) -> u32 {
        let index = keyframe.index();
        let writer = Arc::clone(&self.writer);
        let frame = Arc::clone(&keyframe.frame);
        let dir = output_dir.to_path_buf();
        let format = self.config.output_format;
        let quality = self.config.effective_quality();

        match policy.call_with_timeout("write frame", move || {
            writer.write(&frame, &dir, format, quality)
        }) {
            Ok(written) => {
                let retries = written.retries();
                debug!(
                    "🖼️ Keyframe {} (quality {:.3}, similarity {:.3})",
                    index, keyframe.result.quality_composite, keyframe.result.similarity_to_cache
                );
                summary.kept += 1;
                summary.keyframes.push(KeyframeRecord {
                    index,
                    timestamp_ms: keyframe.frame.timestamp_ms(),
                    quality_composite: keyframe.result.quality_composite,
                    motion_score: keyframe.result.motion_score,
                    similarity_to_cache: keyframe.result.similarity_to_cache,
                    metadata: keyframe.metadata,
                    path: written.value,
                });
                retries
            }
            Err(e) => {
                error!("❌ Failed to write keyframe {}: {}", index, e);
                summary.skipped_on_error += 1;
                summary.failures.push(FrameFailure::new(Some(index), &e.error));
                e.retries()
            }
        }
    }

    fn report_progress(&self, summary: &RunSummary, frame_count: Option<u64>) {
        if let Some(callback) = &self.progress {
            callback(summary.progress(frame_count));
        }
    }
}

/// Decodes frames into the buffer until the source ends, `interrupted`
/// reports a reason, or a non-recoverable error occurs.
fn produce<F>(
    source: &mut dyn FrameSource,
    buffer: &FrameBuffer,
    policy: &RetryPolicy,
    interrupted: F,
) -> ProducerReport
where
    F: Fn() -> Option<(KeyframeError, String)>,
{
    let mut report = ProducerReport::default();
    let mut failures = 0u32;

    'frames: loop {
        if let Some(reason) = interrupted() {
            report.truncated = Some(reason);
            break;
        }

        let frame = match policy.call("read frame", || source.next_frame()) {
            Ok(retried) => {
                report.retries += retried.retries();
                failures = 0;
                retried.value
            }
            Err(e) => {
                report.retries += e.retries();
                let skippable = e.is_recoverable() || e.error.is_frame_local();
                if skippable && failures + 1 < MAX_CONSECUTIVE_FAILURES {
                    // 失败的读取不推进帧源，需显式跳过
                    let skipped = source.skip_frame();
                    warn!(
                        "⚠️ Skipping unreadable frame {}: {}",
                        skipped.map_or_else(|| "?".to_string(), |i| i.to_string()),
                        e
                    );
                    report.failures.push(FrameFailure::new(skipped, &e.error));
                    if skipped.is_some() {
                        report.read += 1;
                    }
                    failures += 1;
                    continue;
                }
                report.fatal = Some((e.error, report.read));
                break;
            }
        };
        let Some(mut frame) = frame else {
            debug!("📭 Source exhausted after {} frames", report.read);
            break;
        };
        report.read += 1;

        // 背压：缓冲满时阻塞等待，不丢帧
        loop {
            match buffer.enqueue_timeout(frame, POLL_INTERVAL) {
                Ok(_) => break,
                Err(Rejected {
                    error: KeyframeError::Timeout(_),
                    frame: returned,
                }) => {
                    if let Some(reason) = interrupted() {
                        report.truncated = Some(reason);
                        break 'frames;
                    }
                    frame = returned;
                }
                Err(Rejected {
                    error: e @ KeyframeError::FrameTooLarge { .. },
                    frame: returned,
                }) => {
                    warn!("⚠️ Dropping frame {}: {}", returned.index, e);
                    report.failures.push(FrameFailure::new(Some(returned.index), &e));
                    break;
                }
                Err(Rejected { error, .. }) => {
                    debug!("📪 Producer stopped: {}", error);
                    break 'frames;
                }
            }
        }
    }
    report
}

/// 工作线程：取帧、计算单帧信号、交给选择器
fn analyze_worker(buffer: &FrameBuffer, analyzer: &FrameAnalyzer, tx: &mpsc::Sender<WorkerOutput>) {
    loop {
        let item = match buffer.dequeue_timeout(POLL_INTERVAL) {
            Ok(item) => item,
            Err(KeyframeError::Timeout(_)) | Err(KeyframeError::Empty) => continue,
            Err(_) => break,
        };

        let index = item.frame.index;
        let outcome = analyzer.prepare(&item.frame).map(|signals| PreparedFrame {
            frame: item.frame,
            signals,
        });
        let output = WorkerOutput {
            seq: item.seq,
            index,
            outcome,
            _lease: item.lease,
        };
        if tx.send(output).is_err() {
            break;
        }
    }
}

pub fn write_report(summary: &RunSummary, output_dir: &Path) -> Result<PathBuf> {
    let path = output_dir.join(REPORT_FILE_NAME);
    let file = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(file, summary)?;
    Ok(path)
}
