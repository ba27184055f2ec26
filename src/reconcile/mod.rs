//! Reconciliation of two independent provider transcripts.
//!
//! Produces one authoritative transcript plus an auditable discrepancy
//! trail and quality metrics. Reconciliation never fails a job: with one
//! usable provider result it degrades to a pass-through, and when the
//! arbiter is unavailable it falls back to the confidence rule.

pub mod align;
pub mod arbiter;

pub use align::{align, overlap_ratio, Alignment};
pub use arbiter::{Arbiter, ArbiterConfig, ArbiterError, Arbitration, ArbitrationRequest, HttpArbiter};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::provider::{ProviderResult, TranscriptSegment};

/// Which side a discrepancy was resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChosenSource {
    A,
    B,
    Arbitrated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub chosen: ChosenSource,
    pub final_text: String,
    /// Free-text reasoning from the arbiter, when one was consulted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// A pair of aligned segments whose text differs after normalization.
/// Recorded for the audit trail; never mutated after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub index_a: usize,
    pub index_b: usize,
    pub text_a: String,
    pub text_b: String,
    pub confidence_a: f64,
    pub confidence_b: f64,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Share of aligned pairs with identical normalized text.
    /// None when fewer than two providers produced segments.
    pub provider_agreement_rate: Option<f64>,
    /// Mean confidence over the final segments
    pub mean_confidence: f64,
    /// Discrepancies that needed arbitration; worth a human look
    pub segments_needing_review: usize,
}

/// The single authoritative transcript for a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciledTranscript {
    pub job_id: String,
    pub final_segments: Vec<TranscriptSegment>,
    pub discrepancies: Vec<Discrepancy>,
    pub quality: QualityMetrics,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Minimum temporal overlap (share of the shorter segment) for two
    /// segments to count as the same utterance
    pub overlap_threshold: f64,
    /// Confidence gap at or above which the higher-confidence side wins
    /// without arbitration
    pub resolution_threshold: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.5,
            resolution_threshold: 0.15,
        }
    }
}

/// Case- and punctuation-insensitive comparison form of a text.
pub fn normalize_text(s: &str) -> String {
    let filtered: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    filtered
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Reconciler {
    config: ReconcileConfig,
    arbiter: Arc<dyn Arbiter>,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig, arbiter: Arc<dyn Arbiter>) -> Self {
        Self { config, arbiter }
    }

    /// Produce the authoritative transcript for `job_id` from up to two
    /// provider results.
    pub async fn reconcile(
        &self,
        job_id: &str,
        results: &[ProviderResult],
    ) -> ReconciledTranscript {
        let candidates: Vec<&ProviderResult> = results
            .iter()
            .filter(|r| r.is_success() && !r.segments.is_empty())
            .collect();

        match candidates.as_slice() {
            [a, b] => self.reconcile_pair(job_id, a, b).await,
            [single] => {
                info!(
                    "Job {}: degraded mode, only {} produced a transcript",
                    job_id, single.provider
                );
                Self::pass_through(job_id, single)
            }
            _ => {
                // Both empty (silence) or absent. An empty transcript is a
                // valid outcome, not an error.
                info!("Job {}: no provider produced segments", job_id);
                ReconciledTranscript {
                    job_id: job_id.to_string(),
                    final_segments: Vec::new(),
                    discrepancies: Vec::new(),
                    quality: QualityMetrics {
                        provider_agreement_rate: None,
                        mean_confidence: 0.0,
                        segments_needing_review: 0,
                    },
                }
            }
        }
    }

    /// Degraded mode: one surviving provider, segments pass through
    /// unchanged with reduced confidence flagged via the missing
    /// agreement rate.
    fn pass_through(job_id: &str, result: &ProviderResult) -> ReconciledTranscript {
        let final_segments = result.segments.clone();
        let mean_confidence = mean(&final_segments);
        ReconciledTranscript {
            job_id: job_id.to_string(),
            final_segments,
            discrepancies: Vec::new(),
            quality: QualityMetrics {
                provider_agreement_rate: None,
                mean_confidence,
                segments_needing_review: 0,
            },
        }
    }

    async fn reconcile_pair(
        &self,
        job_id: &str,
        a: &ProviderResult,
        b: &ProviderResult,
    ) -> ReconciledTranscript {
        let alignments = align(&a.segments, &b.segments, self.config.overlap_threshold);

        let mut final_segments: Vec<TranscriptSegment> = Vec::with_capacity(alignments.len());
        let mut discrepancies = Vec::new();
        let mut aligned_pairs = 0usize;
        let mut agreeing_pairs = 0usize;
        let mut arbitrated = 0usize;

        for alignment in alignments {
            match alignment {
                Alignment::OnlyA(i) => final_segments.push(a.segments[i].clone()),
                Alignment::OnlyB(j) => final_segments.push(b.segments[j].clone()),
                Alignment::Pair { a: i, b: j } => {
                    aligned_pairs += 1;
                    let seg_a = &a.segments[i];
                    let seg_b = &b.segments[j];

                    if normalize_text(&seg_a.text) == normalize_text(&seg_b.text) {
                        agreeing_pairs += 1;
                        final_segments.push(higher_confidence(seg_a, seg_b).clone());
                        continue;
                    }

                    let context = trailing_context(&final_segments);
                    let (segment, resolution) = self
                        .resolve_discrepancy(seg_a, seg_b, context)
                        .await;
                    if resolution.chosen == ChosenSource::Arbitrated {
                        arbitrated += 1;
                    }
                    discrepancies.push(Discrepancy {
                        index_a: i,
                        index_b: j,
                        text_a: seg_a.text.clone(),
                        text_b: seg_b.text.clone(),
                        confidence_a: seg_a.confidence,
                        confidence_b: seg_b.confidence,
                        resolution,
                    });
                    final_segments.push(segment);
                }
            }
        }

        final_segments.sort_by(|x, y| {
            x.start_secs
                .partial_cmp(&y.start_secs)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let quality = QualityMetrics {
            provider_agreement_rate: if aligned_pairs > 0 {
                Some(agreeing_pairs as f64 / aligned_pairs as f64)
            } else {
                None
            },
            mean_confidence: mean(&final_segments),
            segments_needing_review: arbitrated,
        };

        info!(
            "Job {}: reconciled {} segments, {} discrepancies ({} arbitrated), agreement {:?}",
            job_id,
            final_segments.len(),
            discrepancies.len(),
            arbitrated,
            quality.provider_agreement_rate
        );

        ReconciledTranscript {
            job_id: job_id.to_string(),
            final_segments,
            discrepancies,
            quality,
        }
    }

    /// Resolve one differing pair to a final segment.
    ///
    /// A confidence gap at or above the threshold settles it
    /// deterministically; genuinely ambiguous pairs go to the arbiter,
    /// with the confidence rule as the fallback when arbitration is
    /// unavailable.
    async fn resolve_discrepancy(
        &self,
        seg_a: &TranscriptSegment,
        seg_b: &TranscriptSegment,
        context: String,
    ) -> (TranscriptSegment, Resolution) {
        let gap = (seg_a.confidence - seg_b.confidence).abs();
        if gap >= self.config.resolution_threshold {
            let (winner, chosen) = if seg_a.confidence >= seg_b.confidence {
                (seg_a, ChosenSource::A)
            } else {
                (seg_b, ChosenSource::B)
            };
            return (
                winner.clone(),
                Resolution {
                    chosen,
                    final_text: winner.text.clone(),
                    reasoning: None,
                },
            );
        }

        let request = ArbitrationRequest {
            context,
            text_a: seg_a.text.clone(),
            text_b: seg_b.text.clone(),
        };
        match self.arbiter.resolve(&request).await {
            Ok(arbitration) => {
                let base = higher_confidence(seg_a, seg_b);
                let segment = TranscriptSegment {
                    text: arbitration.final_text.clone(),
                    // Split the difference: neither side earned its score
                    confidence: (seg_a.confidence + seg_b.confidence) / 2.0,
                    ..base.clone()
                };
                (
                    segment,
                    Resolution {
                        chosen: ChosenSource::Arbitrated,
                        final_text: arbitration.final_text,
                        reasoning: arbitration.reasoning,
                    },
                )
            }
            Err(e) => {
                warn!(
                    "Arbitration unavailable, falling back to confidence rule: {}",
                    e
                );
                let (winner, chosen) = if seg_a.confidence >= seg_b.confidence {
                    (seg_a, ChosenSource::A)
                } else {
                    (seg_b, ChosenSource::B)
                };
                (
                    winner.clone(),
                    Resolution {
                        chosen,
                        final_text: winner.text.clone(),
                        reasoning: None,
                    },
                )
            }
        }
    }
}

fn higher_confidence<'a>(
    a: &'a TranscriptSegment,
    b: &'a TranscriptSegment,
) -> &'a TranscriptSegment {
    if b.confidence > a.confidence {
        b
    } else {
        a
    }
}

fn mean(segments: &[TranscriptSegment]) -> f64 {
    if segments.is_empty() {
        return 0.0;
    }
    segments.iter().map(|s| s.confidence).sum::<f64>() / segments.len() as f64
}

/// Tail of the transcript assembled so far, handed to the arbiter as
/// context.
fn trailing_context(final_segments: &[TranscriptSegment]) -> String {
    let tail: Vec<&str> = final_segments
        .iter()
        .rev()
        .take(3)
        .map(|s| s.text.as_str())
        .collect();
    tail.into_iter().rev().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderId;
    use async_trait::async_trait;

    fn seg(start: f64, end: f64, text: &str, confidence: f64) -> TranscriptSegment {
        TranscriptSegment {
            start_secs: start,
            end_secs: end,
            text: text.to_string(),
            speaker: None,
            confidence,
        }
    }

    fn success(provider: ProviderId, segments: Vec<TranscriptSegment>) -> ProviderResult {
        let overall = if segments.is_empty() { 0.0 } else { 0.9 };
        ProviderResult::success(provider, segments, overall)
    }

    /// Arbiter that always answers with a fixed text.
    struct FixedArbiter(String);

    #[async_trait]
    impl Arbiter for FixedArbiter {
        async fn resolve(
            &self,
            _request: &ArbitrationRequest,
        ) -> Result<Arbitration, ArbiterError> {
            Ok(Arbitration {
                final_text: self.0.clone(),
                reasoning: Some("fixture".to_string()),
            })
        }
    }

    /// Arbiter that is always down.
    struct DownArbiter;

    #[async_trait]
    impl Arbiter for DownArbiter {
        async fn resolve(
            &self,
            _request: &ArbitrationRequest,
        ) -> Result<Arbitration, ArbiterError> {
            Err(ArbiterError::Api {
                status: 503,
                message: "unavailable".to_string(),
            })
        }
    }

    /// Arbiter that panics when consulted, to prove a path never calls it.
    struct UnreachableArbiter;

    #[async_trait]
    impl Arbiter for UnreachableArbiter {
        async fn resolve(
            &self,
            _request: &ArbitrationRequest,
        ) -> Result<Arbitration, ArbiterError> {
            panic!("arbiter must not be consulted");
        }
    }

    fn reconciler(arbiter: Arc<dyn Arbiter>) -> Reconciler {
        Reconciler::new(ReconcileConfig::default(), arbiter)
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("Hello, World!"), "hello world");
        assert_eq!(normalize_text("five p.m."), "five p m");
        assert_eq!(normalize_text("  spaced   out "), "spaced out");
    }

    #[tokio::test]
    async fn test_degraded_mode_passes_through() {
        let alpha = success(
            ProviderId::Alpha,
            vec![seg(0.0, 2.0, "hello there", 0.9), seg(2.0, 4.0, "general", 0.8)],
        );
        let beta = ProviderResult::failed(ProviderId::Beta, "timeout");

        let out = reconciler(Arc::new(UnreachableArbiter))
            .reconcile("job-1", &[alpha.clone(), beta])
            .await;

        assert_eq!(out.final_segments, alpha.segments);
        assert_eq!(out.quality.provider_agreement_rate, None);
        assert!(out.discrepancies.is_empty());
        assert_eq!(out.quality.segments_needing_review, 0);
    }

    #[tokio::test]
    async fn test_empty_provider_falls_to_degraded() {
        let alpha = success(ProviderId::Alpha, vec![]);
        let beta = success(ProviderId::Beta, vec![seg(0.0, 1.0, "hi", 0.7)]);

        let out = reconciler(Arc::new(UnreachableArbiter))
            .reconcile("job-1", &[alpha, beta.clone()])
            .await;

        assert_eq!(out.final_segments, beta.segments);
        assert_eq!(out.quality.provider_agreement_rate, None);
    }

    #[tokio::test]
    async fn test_both_empty_yields_empty_transcript() {
        let alpha = success(ProviderId::Alpha, vec![]);
        let beta = success(ProviderId::Beta, vec![]);

        let out = reconciler(Arc::new(UnreachableArbiter))
            .reconcile("job-1", &[alpha, beta])
            .await;

        assert!(out.final_segments.is_empty());
        assert_eq!(out.quality.mean_confidence, 0.0);
        assert_eq!(out.quality.provider_agreement_rate, None);
    }

    #[tokio::test]
    async fn test_agreeing_pair_keeps_higher_confidence() {
        let alpha = success(ProviderId::Alpha, vec![seg(0.0, 2.0, "Hello world", 0.7)]);
        let beta = success(ProviderId::Beta, vec![seg(0.0, 2.0, "hello, world!", 0.95)]);

        let out = reconciler(Arc::new(UnreachableArbiter))
            .reconcile("job-1", &[alpha, beta])
            .await;

        assert_eq!(out.final_segments.len(), 1);
        assert_eq!(out.final_segments[0].text, "hello, world!");
        assert_eq!(out.quality.provider_agreement_rate, Some(1.0));
        assert!(out.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn test_high_confidence_gap_resolves_without_arbiter() {
        let alpha = success(ProviderId::Alpha, vec![seg(0.0, 2.0, "buy the dip", 0.95)]);
        let beta = success(ProviderId::Beta, vec![seg(0.0, 2.0, "bye the ship", 0.6)]);

        let out = reconciler(Arc::new(UnreachableArbiter))
            .reconcile("job-1", &[alpha, beta])
            .await;

        assert_eq!(out.final_segments[0].text, "buy the dip");
        assert_eq!(out.discrepancies.len(), 1);
        assert_eq!(out.discrepancies[0].resolution.chosen, ChosenSource::A);
        assert_eq!(out.quality.segments_needing_review, 0);
        assert_eq!(out.quality.provider_agreement_rate, Some(0.0));
    }

    #[tokio::test]
    async fn test_ambiguous_pair_goes_to_arbitration() {
        // The worked example: 0.91 vs 0.80, gap below the 0.15 threshold.
        let alpha = success(ProviderId::Alpha, vec![seg(0.0, 2.0, "meet at 5 pm", 0.91)]);
        let beta = success(
            ProviderId::Beta,
            vec![seg(0.0, 2.1, "meet at five p.m.", 0.80)],
        );

        let out = reconciler(Arc::new(FixedArbiter("meet at 5 pm".to_string())))
            .reconcile("job-1", &[alpha, beta])
            .await;

        assert_eq!(out.final_segments[0].text, "meet at 5 pm");
        assert_eq!(out.discrepancies.len(), 1);
        assert_eq!(
            out.discrepancies[0].resolution.chosen,
            ChosenSource::Arbitrated
        );
        assert_eq!(
            out.discrepancies[0].resolution.reasoning.as_deref(),
            Some("fixture")
        );
        assert_eq!(out.quality.segments_needing_review, 1);
    }

    #[tokio::test]
    async fn test_arbiter_down_falls_back_to_confidence() {
        let alpha = success(ProviderId::Alpha, vec![seg(0.0, 2.0, "meet at 5 pm", 0.91)]);
        let beta = success(
            ProviderId::Beta,
            vec![seg(0.0, 2.1, "meet at five p.m.", 0.80)],
        );

        let out = reconciler(Arc::new(DownArbiter))
            .reconcile("job-1", &[alpha, beta])
            .await;

        // Fallback picks the higher-confidence side and records no
        // arbitration.
        assert_eq!(out.final_segments[0].text, "meet at 5 pm");
        assert_eq!(out.discrepancies[0].resolution.chosen, ChosenSource::A);
        assert_eq!(out.quality.segments_needing_review, 0);
    }

    #[tokio::test]
    async fn test_insertions_merge_in_time_order() {
        let alpha = success(
            ProviderId::Alpha,
            vec![seg(0.0, 2.0, "hello", 0.9), seg(6.0, 8.0, "goodbye", 0.9)],
        );
        let beta = success(
            ProviderId::Beta,
            vec![
                seg(0.0, 2.0, "hello", 0.8),
                seg(3.0, 5.0, "missed by alpha", 0.7),
                seg(6.1, 8.2, "goodbye", 0.8),
            ],
        );

        let out = reconciler(Arc::new(UnreachableArbiter))
            .reconcile("job-1", &[alpha, beta])
            .await;

        let texts: Vec<&str> = out.final_segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "missed by alpha", "goodbye"]);
        assert_eq!(out.quality.provider_agreement_rate, Some(1.0));
    }

    #[tokio::test]
    async fn test_speaker_labels_preserved_not_reconciled() {
        let mut a_seg = seg(0.0, 2.0, "hello world", 0.9);
        a_seg.speaker = Some("alice".to_string());
        let mut b_seg = seg(0.0, 2.0, "hello world", 0.7);
        b_seg.speaker = Some("S0".to_string());

        let alpha = success(ProviderId::Alpha, vec![a_seg]);
        let beta = success(ProviderId::Beta, vec![b_seg]);

        let out = reconciler(Arc::new(UnreachableArbiter))
            .reconcile("job-1", &[alpha, beta])
            .await;

        // The winning segment carries its own label unchanged.
        assert_eq!(out.final_segments[0].speaker.as_deref(), Some("alice"));
    }

    #[test]
    fn test_transcript_serde_round_trip() {
        let transcript = ReconciledTranscript {
            job_id: "job-42".to_string(),
            final_segments: vec![seg(0.0, 2.0, "meet at 5 pm", 0.855)],
            discrepancies: vec![Discrepancy {
                index_a: 0,
                index_b: 0,
                text_a: "meet at 5 pm".to_string(),
                text_b: "meet at five p.m.".to_string(),
                confidence_a: 0.91,
                confidence_b: 0.80,
                resolution: Resolution {
                    chosen: ChosenSource::Arbitrated,
                    final_text: "meet at 5 pm".to_string(),
                    reasoning: Some("numeric form matches context".to_string()),
                },
            }],
            quality: QualityMetrics {
                provider_agreement_rate: Some(0.0),
                mean_confidence: 0.855,
                segments_needing_review: 1,
            },
        };

        let json = serde_json::to_string(&transcript).unwrap();
        let back: ReconciledTranscript = serde_json::from_str(&json).unwrap();
        assert_eq!(back.final_segments, transcript.final_segments);
        assert_eq!(back.discrepancies, transcript.discrepancies);
        assert_eq!(back.quality, transcript.quality);
    }
}
