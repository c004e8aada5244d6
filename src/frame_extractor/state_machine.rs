use std::sync::Arc;

use log::{debug, warn};

use crate::core::error::{KeyframeError, Result};
use crate::core::video::{Frame, FrameMetadata, LumaPlane};
use crate::frame_extractor::analyzer::{AnalysisResult, FrameAnalyzer, PreparedFrame};
use crate::frame_extractor::cache::{CacheEntry, FrameCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    Idle,
    Evaluating { index: u64 },
    Accepted { index: u64 },
    Rejected { index: u64 },
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectorInput {
    Arrived { index: u64 },
    Analyzed { is_candidate: bool },
    Failed,
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorAction {
    Analyze,
    Keep,
    Discard,
    Skip,
    Finish,
    Ignore,
}

impl SelectorState {
    pub fn new() -> Self {
        SelectorState::Idle
    }

    pub fn transition(&self, input: SelectorInput) -> (SelectorState, SelectorAction) {
        match (*self, input) {
            (SelectorState::Drained, _) => (SelectorState::Drained, SelectorAction::Ignore),

            (SelectorState::Evaluating { index }, SelectorInput::Analyzed { is_candidate }) => {
                if is_candidate {
                    (SelectorState::Accepted { index }, SelectorAction::Keep)
                } else {
                    (SelectorState::Rejected { index }, SelectorAction::Discard)
                }
            }

            (SelectorState::Evaluating { index }, SelectorInput::Failed) => {
                (SelectorState::Rejected { index }, SelectorAction::Skip)
            }

            // 上一帧尚未决定时不接受新帧
            (SelectorState::Evaluating { index }, SelectorInput::Arrived { .. }) => {
                (SelectorState::Evaluating { index }, SelectorAction::Ignore)
            }

            (_, SelectorInput::Arrived { index }) => {
                (SelectorState::Evaluating { index }, SelectorAction::Analyze)
            }

            (_, SelectorInput::EndOfStream) => (SelectorState::Drained, SelectorAction::Finish),

            (state, _) => (state, SelectorAction::Ignore),
        }
    }
}

impl Default for SelectorState {
    fn default() -> Self {
        Self::new()
    }
}

/// 待写出的关键帧
#[derive(Debug, Clone)]
pub struct Keyframe {
    pub frame: Arc<Frame>,
    pub metadata: FrameMetadata,
    pub result: AnalysisResult,
}

impl Keyframe {
    pub fn index(&self) -> u64 {
        self.frame.index
    }
}

/// Outcome of one decided frame.
#[derive(Debug)]
pub struct Verdict {
    pub index: u64,
    pub action: SelectorAction,
    pub result: Option<AnalysisResult>,
    /// Set when the frame was skipped on error.
    pub error: Option<KeyframeError>,
    /// Keyframes that are final and should be written now.
    pub ready: Vec<Keyframe>,
}

/// 串行的关键帧选择器：驱动状态机、维护缓存窗口、处理同一转场内的质量择优
pub struct KeyframeSelector {
    state: SelectorState,
    analyzer: FrameAnalyzer,
    cache: FrameCache,
    burst_frames: u32,
    force_keep: bool,
    pending: Option<Keyframe>,
    decided: u64,
}

impl KeyframeSelector {
    pub fn new(analyzer: FrameAnalyzer, cache_size: usize, burst_frames: u32) -> Self {
        Self {
            state: SelectorState::new(),
            analyzer,
            cache: FrameCache::new(cache_size),
            burst_frames,
            force_keep: false,
            pending: None,
            decided: 0,
        }
    }

    /// 全量提取：同一状态机，候选恒为真，不做比较
    pub fn full_extraction(analyzer: FrameAnalyzer) -> Self {
        Self {
            force_keep: true,
            ..Self::new(analyzer, 1, 0)
        }
    }

    pub fn current_state(&self) -> SelectorState {
        self.state
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    pub fn decided_count(&self) -> u64 {
        self.decided
    }

    fn step(&mut self, input: SelectorInput) -> SelectorAction {
        let (next, action) = self.state.transition(input);
        self.state = next;
        action
    }

    /// Pending burst winner that can no longer be challenged by `index`.
    fn settle_pending(&mut self, index: u64, ready: &mut Vec<Keyframe>) {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|p| index > p.index() + self.burst_frames as u64);
        if expired {
            ready.extend(self.pending.take());
        }
    }

    fn retain(&self, keyframe: &Keyframe, signature: LumaPlane) {
        self.cache.offer_pinned(CacheEntry {
            frame: Arc::clone(&keyframe.frame),
            metadata: keyframe.metadata,
            signature: Arc::new(signature),
            quality: keyframe.result.quality_composite,
        });
    }

    pub fn process(&mut self, prepared: PreparedFrame) -> Result<Verdict> {
        let PreparedFrame { frame, signals } = prepared;
        let index = frame.index;
        let mut ready = Vec::new();

        if self.step(SelectorInput::Arrived { index }) != SelectorAction::Analyze {
            return Err(KeyframeError::analysis(
                index,
                format!("selector is {:?}", self.state),
            ));
        }
        self.settle_pending(index, &mut ready);

        let analysis = if self.force_keep {
            Ok(AnalysisResult::forced(signals.quality))
        } else {
            self.analyzer.decide(index, &signals, &self.cache.window())
        };
        let result = match analysis {
            Ok(result) => result,
            Err(e) => {
                let action = self.step(SelectorInput::Failed);
                self.decided += 1;
                warn!("⚠️ Skipping frame {}: {}", index, e);
                return Ok(Verdict {
                    index,
                    action,
                    result: None,
                    error: Some(e),
                    ready,
                });
            }
        };

        let mut action = self.step(SelectorInput::Analyzed {
            is_candidate: result.is_candidate,
        });
        self.decided += 1;

        if action == SelectorAction::Keep {
            let keyframe = Keyframe {
                frame: Arc::new(frame),
                metadata: signals.metadata,
                result,
            };

            if self.force_keep {
                ready.push(keyframe);
            } else if self.burst_frames == 0 {
                self.retain(&keyframe, signals.signature);
                ready.push(keyframe);
            } else {
                match self.pending.take() {
                    Some(current) if current.result.quality_composite >= result.quality_composite => {
                        // 同一转场内质量不如当前候选，放弃
                        debug!(
                            "🔁 Frame {} loses burst tie-break to frame {}",
                            index,
                            current.index()
                        );
                        self.pending = Some(current);
                        self.state = SelectorState::Rejected { index };
                        action = SelectorAction::Discard;
                    }
                    Some(current) => {
                        debug!(
                            "🔁 Frame {} replaces frame {} as burst winner",
                            index,
                            current.index()
                        );
                        self.cache.remove(current.index());
                        self.retain(&keyframe, signals.signature);
                        self.pending = Some(keyframe);
                    }
                    None => {
                        self.retain(&keyframe, signals.signature);
                        self.pending = Some(keyframe);
                    }
                }
            }
        }

        Ok(Verdict {
            index,
            action,
            result: Some(result),
            error: None,
            ready,
        })
    }

    /// Records a frame the workers could not analyze.
    pub fn process_failure(&mut self, index: u64, error: KeyframeError) -> Verdict {
        let mut ready = Vec::new();
        let action = match self.step(SelectorInput::Arrived { index }) {
            SelectorAction::Analyze => {
                self.settle_pending(index, &mut ready);
                self.decided += 1;
                self.step(SelectorInput::Failed)
            }
            other => other,
        };
        warn!("⚠️ Skipping frame {}: {}", index, error);
        Verdict {
            index,
            action,
            result: None,
            error: Some(error),
            ready,
        }
    }

    /// 流结束：返回尚未写出的最后一个择优关键帧
    pub fn finish(&mut self) -> Vec<Keyframe> {
        match self.step(SelectorInput::EndOfStream) {
            SelectorAction::Finish => self.pending.take().into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ExtractorConfig;
    use crate::core::video::{DefaultScorer, FrameScorer, ScoreError};
    use crate::frame_extractor::analyzer::AnalyzerSettings;
    use crate::frame_extractor::testing::{noise_frame, step_video, uniform_frame};

    fn create_analyzer(config: &ExtractorConfig) -> FrameAnalyzer {
        FrameAnalyzer::new(Arc::new(DefaultScorer::new()), AnalyzerSettings::from_config(config))
    }

    fn prepare(analyzer: &FrameAnalyzer, frame: Frame) -> PreparedFrame {
        let signals = analyzer.prepare(&frame).unwrap();
        PreparedFrame { frame, signals }
    }

    fn run(selector: &mut KeyframeSelector, analyzer: &FrameAnalyzer, frames: Vec<Frame>) -> Vec<u64> {
        let mut kept = Vec::new();
        for frame in frames {
            let verdict = selector.process(prepare(analyzer, frame)).unwrap();
            kept.extend(verdict.ready.iter().map(|k| k.index()));
        }
        kept.extend(selector.finish().iter().map(|k| k.index()));
        kept
    }

    #[test]
    fn test_state_transitions() {
        let state = SelectorState::new();
        let (state, action) = state.transition(SelectorInput::Arrived { index: 0 });
        assert_eq!(state, SelectorState::Evaluating { index: 0 });
        assert_eq!(action, SelectorAction::Analyze);

        let (state, action) = state.transition(SelectorInput::Analyzed { is_candidate: true });
        assert_eq!(state, SelectorState::Accepted { index: 0 });
        assert_eq!(action, SelectorAction::Keep);

        let (state, _) = state.transition(SelectorInput::Arrived { index: 1 });
        let (state, action) = state.transition(SelectorInput::Analyzed { is_candidate: false });
        assert_eq!(state, SelectorState::Rejected { index: 1 });
        assert_eq!(action, SelectorAction::Discard);

        let (state, _) = state.transition(SelectorInput::Arrived { index: 2 });
        let (state, action) = state.transition(SelectorInput::Failed);
        assert_eq!(state, SelectorState::Rejected { index: 2 });
        assert_eq!(action, SelectorAction::Skip);

        let (state, action) = state.transition(SelectorInput::EndOfStream);
        assert_eq!(state, SelectorState::Drained);
        assert_eq!(action, SelectorAction::Finish);

        let (state, action) = state.transition(SelectorInput::Arrived { index: 3 });
        assert_eq!(state, SelectorState::Drained);
        assert_eq!(action, SelectorAction::Ignore);
    }

    #[test]
    fn test_evaluating_ignores_new_arrival() {
        let state = SelectorState::Evaluating { index: 4 };
        let (next, action) = state.transition(SelectorInput::Arrived { index: 5 });
        assert_eq!(next, state);
        assert_eq!(action, SelectorAction::Ignore);
    }

    #[test]
    fn test_step_video_one_keyframe_per_step() {
        let config = ExtractorConfig {
            similarity_threshold: 0.95,
            cache_size: 3,
            ..Default::default()
        };
        let analyzer = create_analyzer(&config);
        let mut selector = KeyframeSelector::new(analyzer.clone(), 3, 0);

        let kept = run(&mut selector, &analyzer, step_video(180, 20, 64));
        assert_eq!(kept, (0..9).map(|s| s * 20).collect::<Vec<u64>>());
        assert_eq!(selector.current_state(), SelectorState::Drained);
        assert!(selector.cache().len() <= 3);
    }

    #[test]
    fn test_full_extraction_keeps_everything() {
        let analyzer = create_analyzer(&ExtractorConfig::default());
        let mut selector = KeyframeSelector::full_extraction(analyzer.clone());
        let kept = run(&mut selector, &analyzer, step_video(30, 10, 16));
        assert_eq!(kept, (0..30).collect::<Vec<u64>>());
        assert!(selector.cache().is_empty());
    }

    #[test]
    fn test_burst_keeps_best_quality() {
        let config = ExtractorConfig {
            similarity_threshold: 0.95,
            ..Default::default()
        };
        let analyzer = create_analyzer(&config);
        let mut selector = KeyframeSelector::new(analyzer.clone(), 5, 3);

        // 转场中连续三帧都足够新颖，噪声帧质量更低
        let frames = vec![
            uniform_frame(32, 32, 128, 0),
            uniform_frame(32, 32, 40, 1),
            noise_frame(32, 32, 5, 2),
            uniform_frame(32, 32, 200, 3),
        ];
        let qualities: Vec<f32> = frames
            .iter()
            .map(|f| analyzer.prepare(f).unwrap().quality)
            .collect();
        let kept = run(&mut selector, &analyzer, frames);

        let best = (0..4)
            .max_by(|a, b| {
                qualities[*a]
                    .partial_cmp(&qualities[*b])
                    .unwrap()
                    .then(b.cmp(a))
            })
            .unwrap() as u64;
        assert_eq!(kept, vec![best]);
    }

    #[test]
    fn test_burst_window_expires() {
        let config = ExtractorConfig {
            similarity_threshold: 0.95,
            ..Default::default()
        };
        let analyzer = create_analyzer(&config);
        let mut selector = KeyframeSelector::new(analyzer.clone(), 5, 2);

        let kept = run(&mut selector, &analyzer, step_video(40, 10, 32));
        assert_eq!(kept, vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_failure_is_skipped() {
        let analyzer = create_analyzer(&ExtractorConfig::default());
        let mut selector = KeyframeSelector::new(analyzer.clone(), 3, 0);
        let err = KeyframeError::analysis(0, "decoder artifact");
        let verdict = selector.process_failure(0, err);
        assert_eq!(verdict.action, SelectorAction::Skip);

        let verdict = selector
            .process(prepare(&analyzer, noise_frame(16, 16, 1, 1)))
            .unwrap();
        assert_eq!(verdict.action, SelectorAction::Keep);
        assert_eq!(selector.decided_count(), 2);
    }

    /// 相似度按帧编号查表（签名首像素即帧编号）
    struct ScriptedScorer {
        similarity: fn(u8, u8) -> f32,
    }

    impl FrameScorer for ScriptedScorer {
        fn sharpness(&self, _: &LumaPlane) -> std::result::Result<f32, ScoreError> {
            Ok(0.5)
        }
        fn noise(&self, _: &LumaPlane) -> std::result::Result<f32, ScoreError> {
            Ok(0.5)
        }
        fn contrast(&self, _: &LumaPlane) -> std::result::Result<f32, ScoreError> {
            Ok(0.5)
        }
        fn exposure(&self, _: &LumaPlane) -> std::result::Result<f32, ScoreError> {
            Ok(0.5)
        }
        fn optical_flow_magnitude(&self, _: &LumaPlane, _: &LumaPlane) -> std::result::Result<f32, ScoreError> {
            Ok(1.0)
        }
        fn structural_similarity(&self, a: &LumaPlane, b: &LumaPlane) -> std::result::Result<f32, ScoreError> {
            Ok((self.similarity)(a.data[0], b.data[0]))
        }
    }

    #[test]
    fn test_full_window_count_is_not_monotonic() {
        // 帧 0..3：1 与 0 较像；2、3 与 1 很像，但与 0 都不像
        fn table(a: u8, b: u8) -> f32 {
            match (a.min(b), a.max(b)) {
                (x, y) if x == y => 1.0,
                (0, 1) => 0.8,
                (0, 2) => 0.3,
                (0, 3) => 0.3,
                (1, 2) => 0.95,
                (1, 3) => 0.95,
                (2, 3) => 0.2,
                _ => 0.0,
            }
        }

        let count_at = |threshold: f32| {
            let config = ExtractorConfig {
                similarity_threshold: threshold,
                ..Default::default()
            };
            let analyzer = FrameAnalyzer::new(
                Arc::new(ScriptedScorer { similarity: table }),
                AnalyzerSettings::from_config(&config),
            );
            let mut selector = KeyframeSelector::new(analyzer.clone(), 1, 0);
            let frames = (0..4u8).map(|i| uniform_frame(8, 8, i, i as u64)).collect();
            run(&mut selector, &analyzer, frames).len()
        };

        // 阈值更低反而保留更多帧
        assert_eq!(count_at(0.9), 2);
        assert_eq!(count_at(0.7), 3);
    }
}
