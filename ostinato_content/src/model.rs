// Content model: the composed material fabrication draws from.
//
// Plain value records, each keyed by its own typed id and pointing at its
// owners through typed foreign keys. They are immutable once loaded into a
// `ContentStore`; fabrication only reads them.
//
// Ownership tree:
//   Project
//   ├─ Library
//   │  ├─ Program (Macro | Main | Beat | Detail)
//   │  │  ├─ ProgramMeme
//   │  │  ├─ ProgramVoice ── ProgramVoiceTrack
//   │  │  └─ ProgramSequence
//   │  │     ├─ ProgramSequenceBinding (offset) ── ProgramSequenceBindingMeme
//   │  │     ├─ ProgramSequenceChord ── ProgramSequenceChordVoicing (per voice)
//   │  │     └─ ProgramSequencePattern (per voice) ── ProgramSequencePatternEvent
//   │  └─ Instrument (Type × Mode × State)
//   │     ├─ InstrumentMeme
//   │     └─ InstrumentAudio
//   └─ Template ── TemplateBinding (→ Library | Program | Instrument)
//
// Every descendant of a Program carries `program_id` directly (not only its
// immediate parent) so that scoping and per-program queries need no joins.
//
// Serde uses camelCase keys, and `type_` fields serialize as `type`. Missing
// fields take `Default` values; `ContentStore` rejects records whose id or
// required foreign keys are nil.

use crate::enums::{
    ContentBindingType, InstrumentMode, InstrumentState, InstrumentType, ProgramState, ProgramType,
};
use crate::ids::*;
use ostinato_music::Note;
use serde::{Deserialize, Serialize};

/// Split a comma-separated field (event tones, voicing notes, audio tones)
/// into trimmed, non-empty values.
pub fn csv_values(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Project, library, template
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Library {
    pub id: LibraryId,
    pub project_id: ProjectId,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Template {
    pub id: TemplateId,
    pub project_id: ProjectId,
    pub name: String,
    pub ship_key: String,
    /// Free-text `TemplateConfig` block.
    pub config: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateBinding {
    pub id: TemplateBindingId,
    pub template_id: TemplateId,
    #[serde(rename = "type")]
    pub type_: ContentBindingType,
    /// Id of the bound Library, Program or Instrument, per `type_`.
    pub target_id: Uuid,
}

// ---------------------------------------------------------------------------
// Program family
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Program {
    pub id: ProgramId,
    pub library_id: LibraryId,
    pub state: ProgramState,
    #[serde(rename = "type")]
    pub type_: ProgramType,
    pub key: String,
    pub tempo: f64,
    pub name: String,
    /// Free-text `ProgramConfig` block.
    pub config: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramMeme {
    pub id: ProgramMemeId,
    pub program_id: ProgramId,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramVoice {
    pub id: ProgramVoiceId,
    pub program_id: ProgramId,
    #[serde(rename = "type")]
    pub type_: InstrumentType,
    pub name: String,
    pub order: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramVoiceTrack {
    pub id: ProgramVoiceTrackId,
    pub program_id: ProgramId,
    pub program_voice_id: ProgramVoiceId,
    pub name: String,
    pub order: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramSequence {
    pub id: ProgramSequenceId,
    pub program_id: ProgramId,
    pub name: String,
    pub key: String,
    /// Length in beats.
    pub total: u32,
    pub intensity: f64,
}

/// Places a sequence at an integer offset within a Macro/Main program.
/// Bindings sharing an offset are alternates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramSequenceBinding {
    pub id: ProgramSequenceBindingId,
    pub program_id: ProgramId,
    pub program_sequence_id: ProgramSequenceId,
    pub offset: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramSequenceBindingMeme {
    pub id: ProgramSequenceBindingMemeId,
    pub program_id: ProgramId,
    pub program_sequence_binding_id: ProgramSequenceBindingId,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramSequenceChord {
    pub id: ProgramSequenceChordId,
    pub program_id: ProgramId,
    pub program_sequence_id: ProgramSequenceId,
    pub name: String,
    /// Position in beats from the start of the sequence.
    pub position: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramSequenceChordVoicing {
    pub id: ProgramSequenceChordVoicingId,
    pub program_id: ProgramId,
    pub program_sequence_chord_id: ProgramSequenceChordId,
    pub program_voice_id: ProgramVoiceId,
    /// Comma-separated notes, e.g. "C3, E3, G3".
    pub notes: String,
}

impl ProgramSequenceChordVoicing {
    /// The tonal notes of this voicing, in listed order.
    pub fn valid_notes(&self) -> Vec<Note> {
        csv_values(&self.notes)
            .iter()
            .filter(|n| Note::is_valid(n))
            .map(|n| Note::of(n))
            .collect()
    }

    /// A voicing with no tonal notes is a placeholder and never voices
    /// anything.
    pub fn is_ghost(&self) -> bool {
        self.valid_notes().is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramSequencePattern {
    pub id: ProgramSequencePatternId,
    pub program_id: ProgramId,
    pub program_sequence_id: ProgramSequenceId,
    pub program_voice_id: ProgramVoiceId,
    pub name: String,
    /// Length in beats; the pattern repeats to fill its section.
    pub total: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramSequencePatternEvent {
    pub id: ProgramSequencePatternEventId,
    pub program_id: ProgramId,
    pub program_sequence_pattern_id: ProgramSequencePatternId,
    pub program_voice_track_id: ProgramVoiceTrackId,
    pub velocity: f64,
    /// Position in beats from the start of the pattern.
    pub position: f64,
    pub duration: f64,
    /// Comma-separated notes; "X" marks an atonal hit.
    pub tones: String,
}

// ---------------------------------------------------------------------------
// Instrument family
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Instrument {
    pub id: InstrumentId,
    pub library_id: LibraryId,
    #[serde(rename = "type")]
    pub type_: InstrumentType,
    pub mode: InstrumentMode,
    pub state: InstrumentState,
    pub name: String,
    pub volume: f64,
    /// Free-text `InstrumentConfig` block.
    pub config: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstrumentMeme {
    pub id: InstrumentMemeId,
    pub instrument_id: InstrumentId,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstrumentAudio {
    pub id: InstrumentAudioId,
    pub instrument_id: InstrumentId,
    pub name: String,
    pub waveform_key: String,
    pub transient_seconds: f64,
    pub loop_beats: f64,
    pub tempo: f64,
    pub intensity: f64,
    /// One-shot event name this audio answers to, e.g. "KICK".
    pub event: String,
    pub volume: f64,
    /// Tonal label: a note list for event-mode audios, a chord name for
    /// chord-mode audios.
    pub tones: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_values_trims_and_skips_blanks() {
        assert_eq!(csv_values(" C3, E3 ,,G3 "), vec!["C3", "E3", "G3"]);
        assert!(csv_values("  ").is_empty());
    }

    #[test]
    fn ghost_voicing_has_no_tonal_notes() {
        let mut voicing = ProgramSequenceChordVoicing {
            notes: "X, ?".to_string(),
            ..Default::default()
        };
        assert!(voicing.is_ghost());
        voicing.notes = "C3, X, G3".to_string();
        assert!(!voicing.is_ghost());
        assert_eq!(voicing.valid_notes(), vec![Note::of("C3"), Note::of("G3")]);
    }

    #[test]
    fn json_uses_camel_case_and_type_key() {
        let voice = ProgramVoice {
            type_: InstrumentType::Pad,
            name: "Warm".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&voice).unwrap();
        assert_eq!(json["type"], "Pad");
        assert!(json.get("programId").is_some());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let audio: InstrumentAudio =
            serde_json::from_str(r#"{"name": "kick", "event": "KICK"}"#).unwrap();
        assert_eq!(audio.name, "kick");
        assert!(audio.id.is_nil());
        assert_eq!(audio.intensity, 0.0);
    }
}
