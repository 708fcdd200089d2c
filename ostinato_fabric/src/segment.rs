// Segment output model: what fabrication actually chose, arranged and timed.
//
// A `Chain` is one fabrication run. It owns an ordered, gap-free run of
// `Segment`s keyed by `SegmentId` (the segment's offset in the chain).
// Everything below a segment is partitioned by segment id:
// - `SegmentChoice`: a program, sequence binding, voice or instrument picked
//   for this segment, with a delta-arc validity window.
// - `SegmentChoiceArrangement`: a choice realised against one pattern.
// - `SegmentChoiceArrangementPick`: one concrete audio trigger.
// - `SegmentChord` / `SegmentChordVoicing`: the harmony actually used.
// - `SegmentMeme`: tags applied to the segment (deduplicated).
// - `SegmentMessage`: in-band diagnostics.
// - `SegmentMeta`: free-form key/value notes (sticky buns live here).
//
// Segment ids are plain chain offsets; every other entity gets a UUID from
// the fabricator's `IdGenerator`.
//
// See also: `segment_store.rs` for the repository and state machine,
// `ostinato_content::model` for the content side.

use crate::enums::*;
use ostinato_content::entity_id;
use ostinato_content::enums::{InstrumentMode, InstrumentType, ProgramType};
use ostinato_content::ids::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delta-arc bound meaning "no limit on this side".
pub const DELTA_UNLIMITED: i32 = -1;

entity_id!(/// A fabrication run.
ChainId);
entity_id!(SegmentChoiceId);
entity_id!(SegmentChoiceArrangementId);
entity_id!(SegmentChoiceArrangementPickId);
entity_id!(SegmentChordId);
entity_id!(SegmentChordVoicingId);
entity_id!(SegmentMemeId);
entity_id!(SegmentMessageId);
entity_id!(SegmentMetaId);

/// Offset of a segment within its chain. The first segment is 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u32);

impl SegmentId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The segment before this one, or `None` for the first segment.
    pub fn previous(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment[{}]", self.0)
    }
}

// ---------------------------------------------------------------------------
// Chain and Segment
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Chain {
    pub id: ChainId,
    pub template_id: TemplateId,
    #[serde(rename = "type")]
    pub type_: ChainType,
    pub state: ChainState,
    pub name: String,
    pub ship_key: String,
    /// Template config block copied when the chain was created.
    pub config: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Segment {
    pub id: SegmentId,
    pub chain_id: ChainId,
    pub state: SegmentState,
    #[serde(rename = "type")]
    pub type_: SegmentType,
    pub begin_at_chain_micros: i64,
    /// Unset until macro/main craft knows the segment's length.
    pub duration_micros: Option<i64>,
    pub key: String,
    /// Length in beats.
    pub total: u32,
    pub intensity: f64,
    pub tempo: f64,
    /// Beats elapsed in the current main program before this segment.
    pub delta: i32,
    pub storage_key: String,
}

impl Segment {
    /// Exclusive end on the chain timeline, if the duration is known.
    pub fn end_at_chain_micros(&self) -> Option<i64> {
        self.duration_micros.map(|d| self.begin_at_chain_micros + d)
    }

    /// True if `[from, to]` touches this segment's half-open span. A segment
    /// without a duration spans everything from its beginning onwards.
    pub fn is_spanning(&self, from_chain_micros: i64, to_chain_micros: i64) -> bool {
        self.begin_at_chain_micros <= to_chain_micros
            && self
                .end_at_chain_micros()
                .is_none_or(|end| end > from_chain_micros)
    }
}

// ---------------------------------------------------------------------------
// Choices, arrangements, picks
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentChoice {
    pub id: SegmentChoiceId,
    pub segment_id: SegmentId,
    pub program_id: Option<ProgramId>,
    pub program_sequence_id: Option<ProgramSequenceId>,
    pub program_sequence_binding_id: Option<ProgramSequenceBindingId>,
    pub program_voice_id: Option<ProgramVoiceId>,
    pub instrument_id: Option<InstrumentId>,
    pub program_type: Option<ProgramType>,
    pub instrument_type: Option<InstrumentType>,
    pub instrument_mode: Option<InstrumentMode>,
    /// Inclusive start of the delta window.
    pub delta_in: i32,
    /// Exclusive end of the delta window.
    pub delta_out: i32,
    pub mute: bool,
}

impl Default for SegmentChoice {
    fn default() -> Self {
        Self {
            id: SegmentChoiceId::default(),
            segment_id: SegmentId::default(),
            program_id: None,
            program_sequence_id: None,
            program_sequence_binding_id: None,
            program_voice_id: None,
            instrument_id: None,
            program_type: None,
            instrument_type: None,
            instrument_mode: None,
            delta_in: DELTA_UNLIMITED,
            delta_out: DELTA_UNLIMITED,
            mute: false,
        }
    }
}

impl SegmentChoice {
    /// Short label for messages and logs.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = self.program_type {
            parts.push(format!("programType={t}"));
        }
        if let Some(t) = self.instrument_type {
            parts.push(format!("instrumentType={t}"));
        }
        if let Some(m) = self.instrument_mode {
            parts.push(format!("instrumentMode={m}"));
        }
        if let Some(id) = self.program_id {
            parts.push(format!("programId={}", id.uuid()));
        }
        if let Some(id) = self.instrument_id {
            parts.push(format!("instrumentId={}", id.uuid()));
        }
        parts.join(", ")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentChoiceArrangement {
    pub id: SegmentChoiceArrangementId,
    pub segment_id: SegmentId,
    pub segment_choice_id: SegmentChoiceId,
    pub program_sequence_pattern_id: Option<ProgramSequencePatternId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentChoiceArrangementPick {
    pub id: SegmentChoiceArrangementPickId,
    pub segment_id: SegmentId,
    pub segment_choice_arrangement_id: SegmentChoiceArrangementId,
    pub program_sequence_pattern_event_id: Option<ProgramSequencePatternEventId>,
    pub segment_chord_voicing_id: Option<SegmentChordVoicingId>,
    pub instrument_audio_id: InstrumentAudioId,
    /// Track name for event picks, the upper-cased instrument type for
    /// chord and loop parts.
    pub event: String,
    pub start_at_segment_micros: i64,
    /// `None` for a one-shot until cutoffs are finalised.
    pub length_micros: Option<i64>,
    pub amplitude: f64,
    pub tones: String,
}

// ---------------------------------------------------------------------------
// Harmony, memes, messages, meta
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentChord {
    pub id: SegmentChordId,
    pub segment_id: SegmentId,
    pub name: String,
    pub position: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentChordVoicing {
    pub id: SegmentChordVoicingId,
    pub segment_id: SegmentId,
    pub segment_chord_id: SegmentChordId,
    #[serde(rename = "type")]
    pub type_: InstrumentType,
    pub notes: String,
}

impl SegmentChordVoicing {
    pub fn valid_notes(&self) -> Vec<ostinato_music::Note> {
        ostinato_content::model::csv_values(&self.notes)
            .iter()
            .filter(|n| ostinato_music::Note::is_valid(n))
            .map(|n| ostinato_music::Note::of(n))
            .collect()
    }

    pub fn contains_any_valid_notes(&self) -> bool {
        !self.valid_notes().is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentMeme {
    pub id: SegmentMemeId,
    pub segment_id: SegmentId,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentMessage {
    pub id: SegmentMessageId,
    pub segment_id: SegmentId,
    #[serde(rename = "type")]
    pub type_: SegmentMessageType,
    pub body: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentMeta {
    pub id: SegmentMetaId,
    pub segment_id: SegmentId,
    pub key: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(begin: i64, duration: Option<i64>) -> Segment {
        Segment {
            begin_at_chain_micros: begin,
            duration_micros: duration,
            ..Default::default()
        }
    }

    #[test]
    fn spanning_is_half_open() {
        let s = segment(1_000, Some(500));
        assert!(s.is_spanning(1_000, 1_000));
        assert!(s.is_spanning(1_499, 1_499));
        assert!(!s.is_spanning(1_500, 1_500));
        assert!(!s.is_spanning(0, 999));
        assert!(s.is_spanning(0, 1_000));
    }

    #[test]
    fn open_ended_segment_spans_everything_after_begin() {
        let s = segment(1_000, None);
        assert!(s.is_spanning(9_999_999, 9_999_999));
        assert!(!s.is_spanning(0, 999));
    }

    #[test]
    fn new_choice_is_unlimited() {
        let choice = SegmentChoice::default();
        assert_eq!(choice.delta_in, DELTA_UNLIMITED);
        assert_eq!(choice.delta_out, DELTA_UNLIMITED);
        assert!(choice.program_id.is_none());
    }

    #[test]
    fn segment_id_navigation() {
        assert_eq!(SegmentId(0).previous(), None);
        assert_eq!(SegmentId(3).previous(), Some(SegmentId(2)));
        assert_eq!(SegmentId(3).next(), SegmentId(4));
        assert_eq!(SegmentId(7).to_string(), "Segment[7]");
    }
}
