//! Diarized transcript types and SRT formatting, shared by the transcribe and
//! render stages.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// On-disk shape of `diarized_transcript.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiarizedTranscript {
    pub utterances: Vec<Utterance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    #[serde(default)]
    pub speaker: u32,
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<Word>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

impl DiarizedTranscript {
    /// Utterances overlapping `[start, end)`, for per-clip subtitles and LLM
    /// excerpts.
    pub fn slice(&self, start: f64, end: f64) -> Vec<&Utterance> {
        self.utterances
            .iter()
            .filter(|u| u.end > start && u.start < end)
            .collect()
    }

    /// Words fully inside `[start, end]`, for burned-in word-level subtitles.
    pub fn words_in_range(&self, start: f64, end: f64) -> Vec<&Word> {
        self.utterances
            .iter()
            .flat_map(|u| u.words.iter())
            .filter(|w| w.start >= start && w.end <= end)
            .collect()
    }

    /// Render as timestamped speaker-labeled lines for LLM prompts.
    pub fn as_prompt_text(&self) -> String {
        let mut out = String::new();
        for u in &self.utterances {
            let _ = writeln!(
                out,
                "[{:.1}s - {:.1}s] Speaker {}: {}",
                u.start, u.end, u.speaker, u.text
            );
        }
        out
    }
}

/// SRT timecode, `HH:MM:SS,mmm`.
pub fn fmt_timecode(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let total_millis = (seconds * 1000.0).round() as u64;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis % 3_600_000) / 60_000;
    let secs = (total_millis % 60_000) / 1000;
    let millis = total_millis % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

/// Build an SRT document from utterances, shifting timestamps by `offset`
/// (zero for the full episode, the clip start for per-clip subtitles).
pub fn build_srt(utterances: &[&Utterance], offset: f64) -> String {
    let mut out = String::new();
    for (i, u) in utterances.iter().enumerate() {
        let start = (u.start - offset).max(0.0);
        let end = (u.end - offset).max(0.0);
        let _ = writeln!(out, "{}", i + 1);
        let _ = writeln!(out, "{} --> {}", fmt_timecode(start), fmt_timecode(end));
        let _ = writeln!(out, "{}", u.text.trim());
        let _ = writeln!(out);
    }
    out
}

/// Short-form subtitle blocks: four words per cue, timestamps shifted by
/// `offset` so they line up with the rendered clip or segment.
pub fn build_word_srt(words: &[&Word], offset: f64) -> String {
    let mut out = String::new();
    for (idx, chunk) in words.chunks(4).enumerate() {
        let start = chunk[0].start - offset;
        let end = chunk[chunk.len() - 1].end - offset;
        let text: Vec<&str> = chunk.iter().map(|w| w.word.as_str()).collect();
        let _ = writeln!(out, "{}", idx + 1);
        let _ = writeln!(out, "{} --> {}", fmt_timecode(start), fmt_timecode(end));
        let _ = writeln!(out, "{}", text.join(" "));
        let _ = writeln!(out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(start: f64, end: f64, text: &str) -> Utterance {
        Utterance {
            speaker: 0,
            start,
            end,
            text: text.to_string(),
            words: Vec::new(),
        }
    }

    #[test]
    fn test_fmt_timecode() {
        assert_eq!(fmt_timecode(0.0), "00:00:00,000");
        assert_eq!(fmt_timecode(61.5), "00:01:01,500");
        assert_eq!(fmt_timecode(3723.042), "01:02:03,042");
        assert_eq!(fmt_timecode(-1.0), "00:00:00,000");
    }

    #[test]
    fn test_slice_overlap_semantics() {
        let t = DiarizedTranscript {
            utterances: vec![
                utterance(0.0, 5.0, "a"),
                utterance(5.0, 10.0, "b"),
                utterance(10.0, 15.0, "c"),
            ],
        };
        let hits = t.slice(4.0, 11.0);
        let texts: Vec<&str> = hits.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);

        assert!(t.slice(15.0, 20.0).is_empty());
    }

    #[test]
    fn test_build_word_srt_chunks_of_four() {
        let words: Vec<Word> = (0..6)
            .map(|i| Word {
                word: format!("w{}", i),
                start: 10.0 + i as f64,
                end: 10.5 + i as f64,
            })
            .collect();
        let refs: Vec<&Word> = words.iter().collect();
        let srt = build_word_srt(&refs, 10.0);
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:03,500\nw0 w1 w2 w3\n"));
        assert!(srt.contains("2\n00:00:04,000 --> 00:00:05,500\nw4 w5\n"));
    }

    #[test]
    fn test_words_in_range_requires_full_containment() {
        let t = DiarizedTranscript {
            utterances: vec![Utterance {
                speaker: 0,
                start: 0.0,
                end: 10.0,
                text: "a b c".to_string(),
                words: vec![
                    Word { word: "a".to_string(), start: 1.0, end: 2.0 },
                    Word { word: "b".to_string(), start: 4.0, end: 5.5 },
                    Word { word: "c".to_string(), start: 8.0, end: 9.0 },
                ],
            }],
        };
        let hits = t.words_in_range(3.0, 9.0);
        let texts: Vec<&str> = hits.iter().map(|w| w.word.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn test_build_srt_offsets_and_numbers() {
        let t = DiarizedTranscript {
            utterances: vec![utterance(30.0, 33.0, "hello"), utterance(33.0, 36.0, "world")],
        };
        let slices = t.slice(30.0, 36.0);
        let srt = build_srt(&slices, 30.0);
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:03,000\nhello\n"));
        assert!(srt.contains("2\n00:00:03,000 --> 00:00:06,000\nworld\n"));
    }
}
