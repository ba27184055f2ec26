//! Temporal alignment of two segment streams.
//!
//! Provider clocks drift, so segments are matched by time-range overlap
//! rather than index. A pair aligns when the overlap covers more than the
//! configured share of the shorter segment; everything unmatched is an
//! insertion specific to one provider.

use crate::provider::TranscriptSegment;

/// One entry in the alignment of stream A against stream B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Segments at these indices overlap enough to be the same utterance.
    Pair { a: usize, b: usize },
    /// Segment present only in A's output.
    OnlyA(usize),
    /// Segment present only in B's output.
    OnlyB(usize),
}

/// Overlap duration as a share of the shorter segment.
///
/// Dividing by the shorter side lets a brief utterance fully contained in
/// a longer one still align.
pub fn overlap_ratio(a: &TranscriptSegment, b: &TranscriptSegment) -> f64 {
    let overlap = a.end_secs.min(b.end_secs) - a.start_secs.max(b.start_secs);
    if overlap <= 0.0 {
        return 0.0;
    }
    let shorter = a.duration_secs().min(b.duration_secs());
    if shorter <= 0.0 {
        return 0.0;
    }
    overlap / shorter
}

/// Greedy two-pointer sweep over both streams in start-time order.
///
/// Both inputs are assumed ordered by start time, which every provider
/// guarantees. Whichever unaligned segment ends first is emitted as an
/// insertion, so the sweep is linear and never revisits a segment.
pub fn align(
    a: &[TranscriptSegment],
    b: &[TranscriptSegment],
    overlap_threshold: f64,
) -> Vec<Alignment> {
    let mut out = Vec::with_capacity(a.len().max(b.len()));
    let mut i = 0;
    let mut j = 0;

    while i < a.len() && j < b.len() {
        if overlap_ratio(&a[i], &b[j]) > overlap_threshold {
            out.push(Alignment::Pair { a: i, b: j });
            i += 1;
            j += 1;
        } else if a[i].end_secs <= b[j].end_secs {
            out.push(Alignment::OnlyA(i));
            i += 1;
        } else {
            out.push(Alignment::OnlyB(j));
            j += 1;
        }
    }
    while i < a.len() {
        out.push(Alignment::OnlyA(i));
        i += 1;
    }
    while j < b.len() {
        out.push(Alignment::OnlyB(j));
        j += 1;
    }

    out
}
