//! Speaker segmentation engine.
//!
//! Classifies episode time into speaker regions from two per-channel energy
//! signals (dB per fixed-size frame) and emits a contiguous, non-overlapping
//! segment list covering the whole episode. Consumed by every render stage;
//! the per-frame dB arrays are retained for clip boundary snapping.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ProcessingConfig;
use crate::error::StageError;

const DB_EPSILON: f64 = 1e-10;
const NOISE_FLOOR_PERCENTILE: f64 = 10.0;
const CORRELATION_SUBSAMPLE: usize = 10;

/// Which physical microphone channel a time range belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Speaker {
    #[serde(rename = "L")]
    Left,
    #[serde(rename = "R")]
    Right,
    #[serde(rename = "BOTH")]
    Both,
    #[serde(rename = "NONE")]
    Silence,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Speaker::Left => "L",
            Speaker::Right => "R",
            Speaker::Both => "BOTH",
            Speaker::Silence => "NONE",
        };
        write!(f, "{}", s)
    }
}

/// A contiguous time range labeled with a dominant speaker channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub speaker: Speaker,
    #[serde(default)]
    pub duration: f64,
}

/// On-disk shape of `segments.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentsFile {
    pub segments: Vec<Segment>,
    pub segment_count: usize,
    pub duration_seconds: f64,
    pub channels_identical: bool,
    #[serde(default)]
    pub frame_count: usize,
}

/// On-disk shape of `work/rms_data.json`, kept for boundary snapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmsData {
    pub frame_seconds: f64,
    pub left_rms_db: Vec<f64>,
    pub right_rms_db: Vec<f64>,
}

/// Tunables for classification, lifted from the `[processing]` config section.
#[derive(Debug, Clone, Copy)]
pub struct SegmentationParams {
    pub frame_seconds: f64,
    pub speech_db_margin: f64,
    pub min_segment_seconds: f64,
    pub both_db_range: f64,
}

impl From<&ProcessingConfig> for SegmentationParams {
    fn from(p: &ProcessingConfig) -> Self {
        Self {
            frame_seconds: p.frame_seconds,
            speech_db_margin: p.speech_db_margin,
            min_segment_seconds: p.min_segment_seconds,
            both_db_range: p.both_db_range,
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// RMS over a full sample buffer.
pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// Per-frame RMS converted to dB. Trailing samples that do not fill a whole
/// frame are dropped.
pub fn frame_rms_db(samples: &[f32], frame_size: usize) -> Vec<f64> {
    if frame_size == 0 {
        return Vec::new();
    }
    samples
        .chunks_exact(frame_size)
        .map(|frame| 20.0 * (rms(frame) + DB_EPSILON).log10())
        .collect()
}

/// Pearson correlation between two equal-length signals, subsampled for speed.
pub fn channel_correlation(left: &[f32], right: &[f32]) -> f64 {
    let n = left.len().min(right.len());
    let a: Vec<f64> = left[..n]
        .iter()
        .step_by(CORRELATION_SUBSAMPLE)
        .map(|&v| v as f64)
        .collect();
    let b: Vec<f64> = right[..n]
        .iter()
        .step_by(CORRELATION_SUBSAMPLE)
        .map(|&v| v as f64)
        .collect();
    if a.len() < 2 {
        return 0.0;
    }

    let len = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / len;
    let mean_b = b.iter().sum::<f64>() / len;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..a.len() {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        // A constant channel correlates with nothing; a pair of identical
        // constant channels is caught by the RMS delta check instead.
        if var_a == 0.0 && var_b == 0.0 {
            return 1.0;
        }
        return 0.0;
    }
    cov / denom
}

/// Level difference between two channels in dB. Zero when either is silent.
pub fn rms_delta_db(left: &[f32], right: &[f32]) -> f64 {
    let left_rms = rms(left);
    let right_rms = rms(right);
    if left_rms > 0.0 && right_rms > 0.0 {
        20.0 * (left_rms / right_rms).log10()
    } else {
        0.0
    }
}

/// The channel-identity pre-check: true when the two channels carry the same
/// mixed signal and per-channel attribution is meaningless.
pub fn channels_identical(
    correlation: f64,
    delta_db: f64,
    max_correlation: f64,
    max_delta_db: f64,
) -> bool {
    correlation.abs() > max_correlation && delta_db.abs() < max_delta_db
}

/// The whole-episode segment emitted when the channel pair is identical.
pub fn single_both_segment(total_duration: f64) -> Vec<Segment> {
    vec![Segment {
        start: 0.0,
        end: round3(total_duration),
        speaker: Speaker::Both,
        duration: round3(total_duration),
    }]
}

/// Low-percentile value of a dB series, used as a robust noise floor.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// Classify per-frame speaker labels from both channels' dB series.
fn classify_frames(left_db: &[f64], right_db: &[f64], params: &SegmentationParams) -> Vec<Speaker> {
    let left_thresh = percentile(left_db, NOISE_FLOOR_PERCENTILE) + params.speech_db_margin;
    let right_thresh = percentile(right_db, NOISE_FLOOR_PERCENTILE) + params.speech_db_margin;

    left_db
        .iter()
        .zip(right_db.iter())
        .map(|(&l, &r)| {
            let l_active = l > left_thresh;
            let r_active = r > right_thresh;
            match (l_active, r_active) {
                (true, false) => Speaker::Left,
                (false, true) => Speaker::Right,
                (false, false) => Speaker::Silence,
                (true, true) => {
                    // Both hot: cross-talk when close in level, otherwise the
                    // louder channel is speaking and leaking into the other mic.
                    if (l - r).abs() <= params.both_db_range {
                        Speaker::Both
                    } else if l > r {
                        Speaker::Left
                    } else {
                        Speaker::Right
                    }
                }
            }
        })
        .collect()
}

/// Reassign a lone silence frame flanked by two frames of the same label, so a
/// one-frame gap never fragments a segment.
fn debounce(labels: &mut [Speaker]) {
    for i in 1..labels.len().saturating_sub(1) {
        if labels[i] == Speaker::Silence && labels[i - 1] == labels[i + 1] {
            labels[i] = labels[i - 1];
        }
    }
}

/// Run-length encode per-frame labels into contiguous segments.
fn encode_runs(labels: &[Speaker], frame_seconds: f64) -> Vec<Segment> {
    let mut segments = Vec::new();
    let Some(&first) = labels.first() else {
        return segments;
    };

    let mut current_label = first;
    let mut current_start = 0usize;
    for (i, &label) in labels.iter().enumerate().skip(1) {
        if label != current_label {
            segments.push(Segment {
                start: round3(current_start as f64 * frame_seconds),
                end: round3(i as f64 * frame_seconds),
                speaker: current_label,
                duration: 0.0,
            });
            current_label = label;
            current_start = i;
        }
    }
    segments.push(Segment {
        start: round3(current_start as f64 * frame_seconds),
        end: round3(labels.len() as f64 * frame_seconds),
        speaker: current_label,
        duration: 0.0,
    });
    segments
}

/// Absorb segments shorter than `min_duration` into an adjacent neighbor,
/// preferring the previous one. Only boundaries move; no time is dropped.
fn absorb_short_segments(mut segments: Vec<Segment>, min_duration: f64) -> Vec<Segment> {
    if segments.len() <= 1 {
        return segments;
    }

    let mut merged = true;
    while merged {
        merged = false;
        let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
        let mut i = 0;
        while i < segments.len() {
            let seg = segments[i].clone();
            let duration = seg.end - seg.start;
            if duration < min_duration && !out.is_empty() {
                if let Some(prev) = out.last_mut() {
                    prev.end = seg.end;
                }
                merged = true;
            } else if duration < min_duration && i + 1 < segments.len() {
                segments[i + 1].start = seg.start;
                merged = true;
            } else {
                out.push(seg);
            }
            i += 1;
        }
        segments = out;
    }
    segments
}

/// Segment an episode from two per-channel dB series.
///
/// The output tiles `[0, total_duration)` exactly: frames under-cover the true
/// duration by less than one frame, so the final segment is stretched to it.
/// Mismatched or empty inputs are a precondition failure; no partial result is
/// produced.
pub fn segment_channels(
    left_db: &[f64],
    right_db: &[f64],
    total_duration: f64,
    params: &SegmentationParams,
) -> Result<Vec<Segment>, StageError> {
    if left_db.is_empty() || right_db.is_empty() {
        return Err(StageError::Precondition(
            "channel energy series are empty".to_string(),
        ));
    }
    if left_db.len() != right_db.len() {
        return Err(StageError::Precondition(format!(
            "channel energy series differ in length: {} vs {}",
            left_db.len(),
            right_db.len()
        )));
    }

    let mut labels = classify_frames(left_db, right_db, params);
    debounce(&mut labels);

    let raw = encode_runs(&labels, params.frame_seconds);
    let mut segments = absorb_short_segments(raw, params.min_segment_seconds);

    if let Some(last) = segments.last_mut() {
        if total_duration > last.end {
            last.end = round3(total_duration);
        }
    }
    for seg in &mut segments {
        seg.duration = round3(seg.end - seg.start);
    }

    Ok(segments)
}

/// Snap a proposed boundary time to the lowest combined-energy frame within
/// `tolerance` seconds. Returns the input unchanged when the window is empty.
pub fn snap_to_energy_minimum(
    t: f64,
    combined_db: &[f64],
    frame_seconds: f64,
    tolerance: f64,
) -> f64 {
    if combined_db.is_empty() || frame_seconds <= 0.0 {
        return t;
    }
    let lo = (((t - tolerance) / frame_seconds).max(0.0)) as usize;
    let hi = (((t + tolerance) / frame_seconds) as usize).min(combined_db.len());
    if lo >= hi {
        return t;
    }

    let mut best = lo;
    for i in lo..hi {
        if combined_db[i] < combined_db[best] {
            best = i;
        }
    }
    round2(best as f64 * frame_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SegmentationParams {
        SegmentationParams {
            frame_seconds: 0.1,
            speech_db_margin: 12.0,
            min_segment_seconds: 2.0,
            both_db_range: 6.0,
        }
    }

    /// dB series: `quiet` frames at -60, speech frames at 0.
    fn series(pattern: &[(usize, f64)]) -> Vec<f64> {
        let mut out = Vec::new();
        for &(count, level) in pattern {
            out.extend(std::iter::repeat(level).take(count));
        }
        out
    }

    fn assert_covers(segments: &[Segment], duration: f64) {
        assert!(!segments.is_empty());
        assert_eq!(segments[0].start, 0.0);
        assert_eq!(segments.last().unwrap().end, duration);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap at boundary");
        }
    }

    #[test]
    fn test_frame_rms_db_drops_partial_frame() {
        let samples = vec![1.0f32; 250];
        let db = frame_rms_db(&samples, 100);
        assert_eq!(db.len(), 2);
        // Full-scale frames sit at ~0 dB.
        assert!(db[0].abs() < 0.01);
    }

    #[test]
    fn test_identical_channels_short_circuit() {
        assert!(channels_identical(0.999, 0.0, 0.95, 3.0));
        assert!(!channels_identical(0.5, 0.0, 0.95, 3.0));
        assert!(!channels_identical(0.999, 5.0, 0.95, 3.0));

        let segments = single_both_segment(120.0);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].speaker, Speaker::Both);
        assert_eq!(segments[0].start, 0.0);
        assert_eq!(segments[0].end, 120.0);
    }

    #[test]
    fn test_correlation_of_identical_signals() {
        let a: Vec<f32> = (0..1000).map(|i| ((i % 37) as f32) - 18.0).collect();
        let corr = channel_correlation(&a, &a);
        assert!((corr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_correlation_of_inverted_signals() {
        let a: Vec<f32> = (0..1000).map(|i| ((i % 37) as f32) - 18.0).collect();
        let b: Vec<f32> = a.iter().map(|v| -v).collect();
        let corr = channel_correlation(&a, &b);
        assert!((corr + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_segmentation_coverage_no_gaps() {
        // 60 s, alternating speakers with silence in between.
        let left = series(&[(100, 0.0), (200, -60.0), (150, 0.0), (150, -60.0)]);
        let right = series(&[(100, -60.0), (200, 0.0), (150, -60.0), (150, 0.0)]);
        let segments = segment_channels(&left, &right, 60.0, &params()).unwrap();
        assert_covers(&segments, 60.0);
    }

    #[test]
    fn test_min_duration_after_absorption() {
        let left = series(&[
            (100, 0.0),
            (5, -60.0), // half-second gap, must be absorbed
            (100, 0.0),
            (95, -60.0),
        ]);
        let right = series(&[(300, -60.0)]);
        let segments = segment_channels(&left, &right, 30.0, &params()).unwrap();
        assert_covers(&segments, 30.0);
        for seg in &segments {
            assert!(
                seg.duration >= 2.0,
                "segment shorter than minimum survived: {:?}",
                seg
            );
        }
    }

    #[test]
    fn test_total_shorter_than_minimum_is_kept() {
        let left = series(&[(10, 0.0)]);
        let right = series(&[(10, -60.0)]);
        let segments = segment_channels(&left, &right, 1.0, &params()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_covers(&segments, 1.0);
    }

    #[test]
    fn test_debounce_removes_lone_silence_frame() {
        // Leading real silence keeps the noise floor low; the lone silent
        // frame at index 40 is flanked by speech and must not survive.
        let mut left = series(&[(20, -60.0), (40, 0.0)]);
        left[40] = -60.0;
        let right = series(&[(60, -60.0)]);
        let segments = segment_channels(&left, &right, 6.0, &params()).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].speaker, Speaker::Silence);
        assert_eq!(segments[1].speaker, Speaker::Left);
        assert_eq!(segments[1].start, 2.0);
    }

    #[test]
    fn test_both_within_range_and_louder_outside_range() {
        // Close levels -> BOTH; far apart -> louder channel wins.
        let left = series(&[(20, -60.0), (40, -3.0), (40, 0.0)]);
        let right = series(&[(20, -60.0), (40, 0.0), (40, -20.0)]);
        let segments = segment_channels(&left, &right, 10.0, &params()).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].speaker, Speaker::Silence);
        assert_eq!(segments[1].speaker, Speaker::Both);
        assert_eq!(segments[2].speaker, Speaker::Left);
    }

    #[test]
    fn test_concrete_scenario_two_speakers() {
        // 1000 Hz sample rate, 10 s, frame of 100 samples (0.1 s): first half
        // loud on A, second half loud on B.
        let sample_rate = 1000usize;
        let frame_size = 100usize;
        let mut left = Vec::with_capacity(sample_rate * 10);
        let mut right = Vec::with_capacity(sample_rate * 10);
        for i in 0..sample_rate * 10 {
            let tone = if i % 2 == 0 { 0.8f32 } else { -0.8f32 };
            if i < sample_rate * 5 {
                left.push(tone);
                right.push(tone * 0.001);
            } else {
                left.push(tone * 0.001);
                right.push(tone);
            }
        }

        let left_db = frame_rms_db(&left, frame_size);
        let right_db = frame_rms_db(&right, frame_size);
        assert_eq!(left_db.len(), 100);

        let segments = segment_channels(&left_db, &right_db, 10.0, &params()).unwrap();
        assert!(segments.len() >= 2);
        assert_eq!(segments[0].speaker, Speaker::Left);
        assert_eq!(segments.last().unwrap().speaker, Speaker::Right);

        let total: f64 = segments.iter().map(|s| s.duration).sum();
        assert!((total - 10.0).abs() < 0.01);
        assert_covers(&segments, 10.0);
    }

    #[test]
    fn test_mismatched_lengths_are_fatal() {
        let left = series(&[(100, 0.0)]);
        let right = series(&[(90, 0.0)]);
        let err = segment_channels(&left, &right, 10.0, &params()).unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));

        let err = segment_channels(&[], &[], 10.0, &params()).unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));
    }

    #[test]
    fn test_snap_to_energy_minimum() {
        // Minimum energy at frame 25 (2.5 s); propose 3.0 s with 1 s tolerance.
        let mut combined = vec![0.0f64; 100];
        combined[25] = -80.0;
        let snapped = snap_to_energy_minimum(3.0, &combined, 0.1, 1.0);
        assert_eq!(snapped, 2.5);

        // Flat window: the earliest frame in the window wins.
        let snapped = snap_to_energy_minimum(9.0, &combined, 0.1, 1.0);
        assert_eq!(snapped, 8.0);

        // Empty energy data leaves the boundary alone.
        assert_eq!(snap_to_energy_minimum(3.0, &[], 0.1, 1.0), 3.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = vec![0.0, 10.0];
        assert_eq!(percentile(&values, 10.0), 1.0);
        assert_eq!(percentile(&values, 50.0), 5.0);
    }
}
