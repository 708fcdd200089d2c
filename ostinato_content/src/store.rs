// In-memory relational index over the content model.
//
// `ContentStore` owns every content entity in one `BTreeMap` table per
// entity kind, keyed by typed id. Access goes through the generic
// `ContentEntity` repository (`get`, `all`, `put`, `len`); each entity kind
// implements the trait through the `content_entity!` table below instead of
// carrying hand-written accessors.
//
// On top of the tables sit the relational queries fabrication needs. They
// follow two rules:
// - Optional relationships answer with `None` or an empty `Vec`, never an
//   error. Only `instrument_type_of_audio` and `instrument_type_of_event`
//   raise `NotFound`, because their callers assume the relationship exists.
// - Results come back in a deterministic order: by offset or position where
//   the query is about placement, otherwise by id.
//
// Type and mode filters treat an empty set as a wildcard.
//
// `for_template` builds a smaller store holding only what one template can
// reach: the template, its bindings, their targets, the published programs
// and instruments of bound libraries, and every descendant of each included
// program and instrument.
//
// **Critical constraint: determinism.** Tables are `BTreeMap`s so iteration
// order is stable across runs and platforms.
//
// See also: `model.rs` (the entities), `builder.rs` (authoring API),
// `ostinato_fabric::fabricator` (the main consumer).

use crate::enums::{
    ContentBindingType, InstrumentMode, InstrumentState, InstrumentType, ProgramState, ProgramType,
};
use crate::error::ContentError;
use crate::ids::*;
use crate::meme::to_meme;
use crate::model::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

// ---------------------------------------------------------------------------
// Generic repository
// ---------------------------------------------------------------------------

/// An entity kind stored in its own `ContentStore` table.
pub trait ContentEntity: Clone + fmt::Debug + Serialize + DeserializeOwned {
    type Id: Copy + Ord + fmt::Display + fmt::Debug;

    /// Human-readable kind name used in errors.
    const NAME: &'static str;

    fn id(&self) -> Self::Id;

    fn id_is_nil(&self) -> bool;

    /// Names of required foreign keys that are nil on this record.
    fn nil_foreign_keys(&self) -> Vec<&'static str>;

    fn table(store: &ContentStore) -> &BTreeMap<Self::Id, Self>;

    fn table_mut(store: &mut ContentStore) -> &mut BTreeMap<Self::Id, Self>;
}

macro_rules! content_entity {
    ($entity:ident, $id:ident, $table:ident, [$($fk:ident),*]) => {
        impl ContentEntity for $entity {
            type Id = $id;
            const NAME: &'static str = stringify!($entity);

            fn id(&self) -> $id {
                self.id
            }

            fn id_is_nil(&self) -> bool {
                self.id.is_nil()
            }

            #[allow(unused_mut)]
            fn nil_foreign_keys(&self) -> Vec<&'static str> {
                let mut nil = Vec::new();
                $(
                    if self.$fk.is_nil() {
                        nil.push(stringify!($fk));
                    }
                )*
                nil
            }

            fn table(store: &ContentStore) -> &BTreeMap<$id, Self> {
                &store.$table
            }

            fn table_mut(store: &mut ContentStore) -> &mut BTreeMap<$id, Self> {
                &mut store.$table
            }
        }
    };
}

content_entity!(Project, ProjectId, projects, []);
content_entity!(Library, LibraryId, libraries, [project_id]);
content_entity!(Template, TemplateId, templates, [project_id]);
content_entity!(TemplateBinding, TemplateBindingId, template_bindings, [template_id, target_id]);
content_entity!(Program, ProgramId, programs, [library_id]);
content_entity!(ProgramMeme, ProgramMemeId, program_memes, [program_id]);
content_entity!(ProgramVoice, ProgramVoiceId, program_voices, [program_id]);
content_entity!(
    ProgramVoiceTrack,
    ProgramVoiceTrackId,
    program_voice_tracks,
    [program_id, program_voice_id]
);
content_entity!(ProgramSequence, ProgramSequenceId, program_sequences, [program_id]);
content_entity!(
    ProgramSequenceBinding,
    ProgramSequenceBindingId,
    program_sequence_bindings,
    [program_id, program_sequence_id]
);
content_entity!(
    ProgramSequenceBindingMeme,
    ProgramSequenceBindingMemeId,
    program_sequence_binding_memes,
    [program_id, program_sequence_binding_id]
);
content_entity!(
    ProgramSequenceChord,
    ProgramSequenceChordId,
    program_sequence_chords,
    [program_id, program_sequence_id]
);
content_entity!(
    ProgramSequenceChordVoicing,
    ProgramSequenceChordVoicingId,
    program_sequence_chord_voicings,
    [program_id, program_sequence_chord_id, program_voice_id]
);
content_entity!(
    ProgramSequencePattern,
    ProgramSequencePatternId,
    program_sequence_patterns,
    [program_id, program_sequence_id, program_voice_id]
);
content_entity!(
    ProgramSequencePatternEvent,
    ProgramSequencePatternEventId,
    program_sequence_pattern_events,
    [program_id, program_sequence_pattern_id, program_voice_track_id]
);
content_entity!(Instrument, InstrumentId, instruments, [library_id]);
content_entity!(InstrumentMeme, InstrumentMemeId, instrument_memes, [instrument_id]);
content_entity!(InstrumentAudio, InstrumentAudioId, instrument_audios, [instrument_id]);

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct ContentStore {
    projects: BTreeMap<ProjectId, Project>,
    libraries: BTreeMap<LibraryId, Library>,
    templates: BTreeMap<TemplateId, Template>,
    template_bindings: BTreeMap<TemplateBindingId, TemplateBinding>,
    programs: BTreeMap<ProgramId, Program>,
    program_memes: BTreeMap<ProgramMemeId, ProgramMeme>,
    program_voices: BTreeMap<ProgramVoiceId, ProgramVoice>,
    program_voice_tracks: BTreeMap<ProgramVoiceTrackId, ProgramVoiceTrack>,
    program_sequences: BTreeMap<ProgramSequenceId, ProgramSequence>,
    program_sequence_bindings: BTreeMap<ProgramSequenceBindingId, ProgramSequenceBinding>,
    program_sequence_binding_memes:
        BTreeMap<ProgramSequenceBindingMemeId, ProgramSequenceBindingMeme>,
    program_sequence_chords: BTreeMap<ProgramSequenceChordId, ProgramSequenceChord>,
    program_sequence_chord_voicings:
        BTreeMap<ProgramSequenceChordVoicingId, ProgramSequenceChordVoicing>,
    program_sequence_patterns: BTreeMap<ProgramSequencePatternId, ProgramSequencePattern>,
    program_sequence_pattern_events:
        BTreeMap<ProgramSequencePatternEventId, ProgramSequencePatternEvent>,
    instruments: BTreeMap<InstrumentId, Instrument>,
    instrument_memes: BTreeMap<InstrumentMemeId, InstrumentMeme>,
    instrument_audios: BTreeMap<InstrumentAudioId, InstrumentAudio>,
}

/// Wire form of a whole store: one camelCase array per entity kind.
#[derive(Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ContentPayload {
    projects: Vec<Project>,
    libraries: Vec<Library>,
    templates: Vec<Template>,
    template_bindings: Vec<TemplateBinding>,
    programs: Vec<Program>,
    program_memes: Vec<ProgramMeme>,
    program_voices: Vec<ProgramVoice>,
    program_voice_tracks: Vec<ProgramVoiceTrack>,
    program_sequences: Vec<ProgramSequence>,
    program_sequence_bindings: Vec<ProgramSequenceBinding>,
    program_sequence_binding_memes: Vec<ProgramSequenceBindingMeme>,
    program_sequence_chords: Vec<ProgramSequenceChord>,
    program_sequence_chord_voicings: Vec<ProgramSequenceChordVoicing>,
    program_sequence_patterns: Vec<ProgramSequencePattern>,
    program_sequence_pattern_events: Vec<ProgramSequencePatternEvent>,
    instruments: Vec<Instrument>,
    instrument_memes: Vec<InstrumentMeme>,
    instrument_audios: Vec<InstrumentAudio>,
}

fn values<E: Clone>(table: &BTreeMap<impl Ord, E>) -> Vec<E> {
    table.values().cloned().collect()
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- generic table access ------------------------------------------------

    pub fn get<E: ContentEntity>(&self, id: E::Id) -> Option<&E> {
        E::table(self).get(&id)
    }

    /// Every entity of one kind, in id order.
    pub fn all<E: ContentEntity>(&self) -> Vec<&E> {
        E::table(self).values().collect()
    }

    pub fn len<E: ContentEntity>(&self) -> usize {
        E::table(self).len()
    }

    /// Insert or replace an entity after checking its id and required
    /// foreign keys are set.
    pub fn put<E: ContentEntity>(&mut self, entity: E) -> Result<E::Id, ContentError> {
        if entity.id_is_nil() {
            return Err(ContentError::InvalidEntity {
                entity: E::NAME,
                reason: "missing id".to_string(),
            });
        }
        let nil = entity.nil_foreign_keys();
        if !nil.is_empty() {
            return Err(ContentError::InvalidEntity {
                entity: E::NAME,
                reason: format!("{} missing required {}", entity.id(), nil.join(", ")),
            });
        }
        Ok(self.insert(entity))
    }

    /// Insert without validation, for entities built from generated ids.
    pub(crate) fn insert<E: ContentEntity>(&mut self, entity: E) -> E::Id {
        let id = entity.id();
        E::table_mut(self).insert(id, entity);
        id
    }

    /// Merge every entity of `other` into this store, replacing by id.
    pub fn put_all(&mut self, other: &ContentStore) {
        fn merge<E: ContentEntity>(into: &mut ContentStore, from: &ContentStore) {
            for e in E::table(from).values() {
                into.insert(e.clone());
            }
        }
        merge::<Project>(self, other);
        merge::<Library>(self, other);
        merge::<Template>(self, other);
        merge::<TemplateBinding>(self, other);
        merge::<Program>(self, other);
        merge::<ProgramMeme>(self, other);
        merge::<ProgramVoice>(self, other);
        merge::<ProgramVoiceTrack>(self, other);
        merge::<ProgramSequence>(self, other);
        merge::<ProgramSequenceBinding>(self, other);
        merge::<ProgramSequenceBindingMeme>(self, other);
        merge::<ProgramSequenceChord>(self, other);
        merge::<ProgramSequenceChordVoicing>(self, other);
        merge::<ProgramSequencePattern>(self, other);
        merge::<ProgramSequencePatternEvent>(self, other);
        merge::<Instrument>(self, other);
        merge::<InstrumentMeme>(self, other);
        merge::<InstrumentAudio>(self, other);
    }

    /// Total number of entities across all tables.
    pub fn entity_count(&self) -> usize {
        self.projects.len()
            + self.libraries.len()
            + self.templates.len()
            + self.template_bindings.len()
            + self.programs.len()
            + self.program_memes.len()
            + self.program_voices.len()
            + self.program_voice_tracks.len()
            + self.program_sequences.len()
            + self.program_sequence_bindings.len()
            + self.program_sequence_binding_memes.len()
            + self.program_sequence_chords.len()
            + self.program_sequence_chord_voicings.len()
            + self.program_sequence_patterns.len()
            + self.program_sequence_pattern_events.len()
            + self.instruments.len()
            + self.instrument_memes.len()
            + self.instrument_audios.len()
    }

    // -- JSON ----------------------------------------------------------------

    /// Load a store from an object of camelCase entity arrays. Every record
    /// is validated as by `put`.
    pub fn from_json(json: &str) -> Result<Self, ContentError> {
        let payload: ContentPayload = serde_json::from_str(json)?;
        let mut store = Self::new();
        fn load<E: ContentEntity>(
            store: &mut ContentStore,
            items: Vec<E>,
        ) -> Result<(), ContentError> {
            for item in items {
                store.put(item)?;
            }
            Ok(())
        }
        load(&mut store, payload.projects)?;
        load(&mut store, payload.libraries)?;
        load(&mut store, payload.templates)?;
        load(&mut store, payload.template_bindings)?;
        load(&mut store, payload.programs)?;
        load(&mut store, payload.program_memes)?;
        load(&mut store, payload.program_voices)?;
        load(&mut store, payload.program_voice_tracks)?;
        load(&mut store, payload.program_sequences)?;
        load(&mut store, payload.program_sequence_bindings)?;
        load(&mut store, payload.program_sequence_binding_memes)?;
        load(&mut store, payload.program_sequence_chords)?;
        load(&mut store, payload.program_sequence_chord_voicings)?;
        load(&mut store, payload.program_sequence_patterns)?;
        load(&mut store, payload.program_sequence_pattern_events)?;
        load(&mut store, payload.instruments)?;
        load(&mut store, payload.instrument_memes)?;
        load(&mut store, payload.instrument_audios)?;
        debug!(entities = store.entity_count(), "loaded content");
        Ok(store)
    }

    pub fn to_json(&self) -> Result<String, ContentError> {
        let payload = ContentPayload {
            projects: values(&self.projects),
            libraries: values(&self.libraries),
            templates: values(&self.templates),
            template_bindings: values(&self.template_bindings),
            programs: values(&self.programs),
            program_memes: values(&self.program_memes),
            program_voices: values(&self.program_voices),
            program_voice_tracks: values(&self.program_voice_tracks),
            program_sequences: values(&self.program_sequences),
            program_sequence_bindings: values(&self.program_sequence_bindings),
            program_sequence_binding_memes: values(&self.program_sequence_binding_memes),
            program_sequence_chords: values(&self.program_sequence_chords),
            program_sequence_chord_voicings: values(&self.program_sequence_chord_voicings),
            program_sequence_patterns: values(&self.program_sequence_patterns),
            program_sequence_pattern_events: values(&self.program_sequence_pattern_events),
            instruments: values(&self.instruments),
            instrument_memes: values(&self.instrument_memes),
            instrument_audios: values(&self.instrument_audios),
        };
        Ok(serde_json::to_string_pretty(&payload)?)
    }

    // -- project / template ----------------------------------------------------

    pub fn project(&self) -> Option<&Project> {
        self.projects.values().next()
    }

    /// Match a template by name, then ship key, then id string.
    pub fn template_by_identifier(&self, identifier: &str) -> Option<&Template> {
        let identifier = identifier.trim();
        let by_id = TemplateId::parse(identifier);
        self.templates
            .values()
            .find(|t| t.name == identifier)
            .or_else(|| self.templates.values().find(|t| t.ship_key == identifier))
            .or_else(|| by_id.and_then(|id| self.templates.get(&id)))
    }

    pub fn first_template(&self) -> Option<&Template> {
        self.templates.values().next()
    }

    pub fn bindings_of_template(&self, template_id: TemplateId) -> Vec<&TemplateBinding> {
        self.template_bindings
            .values()
            .filter(|b| b.template_id == template_id)
            .collect()
    }

    // -- programs --------------------------------------------------------------

    pub fn programs_of_library(&self, library_id: LibraryId) -> Vec<&Program> {
        self.programs
            .values()
            .filter(|p| p.library_id == library_id)
            .collect()
    }

    pub fn programs_of_type(&self, type_: ProgramType) -> Vec<&Program> {
        self.programs.values().filter(|p| p.type_ == type_).collect()
    }

    pub fn memes_of_program(&self, program_id: ProgramId) -> Vec<&ProgramMeme> {
        self.program_memes
            .values()
            .filter(|m| m.program_id == program_id)
            .collect()
    }

    /// Normalised meme names of a program.
    pub fn meme_names_of_program(&self, program_id: ProgramId) -> BTreeSet<String> {
        self.memes_of_program(program_id)
            .iter()
            .map(|m| to_meme(&m.name))
            .filter(|m| !m.is_empty())
            .collect()
    }

    /// Program memes plus the memes of its offset-0 sequence bindings.
    pub fn memes_at_beginning(&self, program_id: ProgramId) -> BTreeSet<String> {
        let mut memes = self.meme_names_of_program(program_id);
        for binding in self.bindings_at_offset_of_program(program_id, 0, false) {
            memes.extend(self.meme_names_of_sequence_binding(binding.id));
        }
        memes
    }

    pub fn voices_of_program(&self, program_id: ProgramId) -> Vec<&ProgramVoice> {
        self.program_voices
            .values()
            .filter(|v| v.program_id == program_id)
            .collect()
    }

    pub fn tracks_of_voice(&self, voice_id: ProgramVoiceId) -> Vec<&ProgramVoiceTrack> {
        self.program_voice_tracks
            .values()
            .filter(|t| t.program_voice_id == voice_id)
            .collect()
    }

    pub fn tracks_of_program(&self, program_id: ProgramId) -> Vec<&ProgramVoiceTrack> {
        self.program_voice_tracks
            .values()
            .filter(|t| t.program_id == program_id)
            .collect()
    }

    pub fn track_names_of_voice(&self, voice_id: ProgramVoiceId) -> BTreeSet<String> {
        self.tracks_of_voice(voice_id)
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn track_of_event(
        &self,
        event: &ProgramSequencePatternEvent,
    ) -> Option<&ProgramVoiceTrack> {
        self.program_voice_tracks.get(&event.program_voice_track_id)
    }

    pub fn voice_of_event(&self, event: &ProgramSequencePatternEvent) -> Option<&ProgramVoice> {
        self.track_of_event(event)
            .and_then(|t| self.program_voices.get(&t.program_voice_id))
    }

    /// The instrument type of the voice an event belongs to. Errors when
    /// the event's track or voice is missing.
    pub fn instrument_type_of_event(
        &self,
        event: &ProgramSequencePatternEvent,
    ) -> Result<InstrumentType, ContentError> {
        self.voice_of_event(event)
            .map(|v| v.type_)
            .ok_or_else(|| ContentError::not_found("ProgramVoice of event", event.id))
    }

    pub fn sequences_of_program(&self, program_id: ProgramId) -> Vec<&ProgramSequence> {
        self.program_sequences
            .values()
            .filter(|s| s.program_id == program_id)
            .collect()
    }

    pub fn sequence_of_binding(
        &self,
        binding: &ProgramSequenceBinding,
    ) -> Option<&ProgramSequence> {
        self.program_sequences.get(&binding.program_sequence_id)
    }

    // -- sequence bindings -----------------------------------------------------

    fn sorted_by_offset(
        mut bindings: Vec<&ProgramSequenceBinding>,
    ) -> Vec<&ProgramSequenceBinding> {
        bindings.sort_by_key(|b| (b.offset, b.id));
        bindings
    }

    pub fn bindings_of_sequence(
        &self,
        sequence_id: ProgramSequenceId,
    ) -> Vec<&ProgramSequenceBinding> {
        Self::sorted_by_offset(
            self.program_sequence_bindings
                .values()
                .filter(|b| b.program_sequence_id == sequence_id)
                .collect(),
        )
    }

    /// All bindings of a program, sorted by offset.
    pub fn sequence_bindings_of_program(
        &self,
        program_id: ProgramId,
    ) -> Vec<&ProgramSequenceBinding> {
        Self::sorted_by_offset(
            self.program_sequence_bindings
                .values()
                .filter(|b| b.program_id == program_id)
                .collect(),
        )
    }

    /// Bindings of a program at `offset`. With `include_nearest`, falls back
    /// to the offset with the smallest absolute difference (the smaller
    /// offset wins a tie). Empty when the program has no bindings.
    pub fn bindings_at_offset_of_program(
        &self,
        program_id: ProgramId,
        offset: i32,
        include_nearest: bool,
    ) -> Vec<&ProgramSequenceBinding> {
        let candidates = self.sequence_bindings_of_program(program_id);
        let target = if include_nearest {
            match candidates
                .iter()
                .map(|b| b.offset)
                .min_by_key(|o| ((*o as i64 - offset as i64).abs(), *o))
            {
                Some(nearest) => nearest,
                None => return Vec::new(),
            }
        } else {
            offset
        };
        candidates.into_iter().filter(|b| b.offset == target).collect()
    }

    /// Sorted unique offsets of a program's bindings.
    pub fn available_offsets(&self, program_id: ProgramId) -> Vec<i32> {
        let offsets: BTreeSet<i32> = self
            .sequence_bindings_of_program(program_id)
            .iter()
            .map(|b| b.offset)
            .collect();
        offsets.into_iter().collect()
    }

    pub fn memes_of_sequence_binding(
        &self,
        binding_id: ProgramSequenceBindingId,
    ) -> Vec<&ProgramSequenceBindingMeme> {
        self.program_sequence_binding_memes
            .values()
            .filter(|m| m.program_sequence_binding_id == binding_id)
            .collect()
    }

    pub fn meme_names_of_sequence_binding(
        &self,
        binding_id: ProgramSequenceBindingId,
    ) -> BTreeSet<String> {
        self.memes_of_sequence_binding(binding_id)
            .iter()
            .map(|m| to_meme(&m.name))
            .filter(|m| !m.is_empty())
            .collect()
    }

    // -- chords and voicings -----------------------------------------------------

    /// Chords of a sequence, sorted by position.
    pub fn chords_of_sequence(&self, sequence_id: ProgramSequenceId) -> Vec<&ProgramSequenceChord> {
        let mut chords: Vec<_> = self
            .program_sequence_chords
            .values()
            .filter(|c| c.program_sequence_id == sequence_id)
            .collect();
        chords.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));
        chords
    }

    pub fn sequence_chords_of_program(&self, program_id: ProgramId) -> Vec<&ProgramSequenceChord> {
        self.program_sequence_chords
            .values()
            .filter(|c| c.program_id == program_id)
            .collect()
    }

    /// Non-ghost voicings of a chord.
    pub fn voicings_of_chord(
        &self,
        chord_id: ProgramSequenceChordId,
    ) -> Vec<&ProgramSequenceChordVoicing> {
        self.program_sequence_chord_voicings
            .values()
            .filter(|v| v.program_sequence_chord_id == chord_id && !v.is_ghost())
            .collect()
    }

    /// Non-ghost voicings of a chord for one voice.
    pub fn voicings_of_chord_and_voice(
        &self,
        chord_id: ProgramSequenceChordId,
        voice_id: ProgramVoiceId,
    ) -> Vec<&ProgramSequenceChordVoicing> {
        self.voicings_of_chord(chord_id)
            .into_iter()
            .filter(|v| v.program_voice_id == voice_id)
            .collect()
    }

    /// Every voicing of a program, ghosts included.
    pub fn chord_voicings_of_program(
        &self,
        program_id: ProgramId,
    ) -> Vec<&ProgramSequenceChordVoicing> {
        self.program_sequence_chord_voicings
            .values()
            .filter(|v| v.program_id == program_id)
            .collect()
    }

    // -- patterns and events -------------------------------------------------------

    pub fn patterns_of_sequence_and_voice(
        &self,
        sequence_id: ProgramSequenceId,
        voice_id: ProgramVoiceId,
    ) -> Vec<&ProgramSequencePattern> {
        self.program_sequence_patterns
            .values()
            .filter(|p| p.program_sequence_id == sequence_id && p.program_voice_id == voice_id)
            .collect()
    }

    pub fn patterns_of_voice(&self, voice_id: ProgramVoiceId) -> Vec<&ProgramSequencePattern> {
        self.program_sequence_patterns
            .values()
            .filter(|p| p.program_voice_id == voice_id)
            .collect()
    }

    fn sorted_by_position(
        mut events: Vec<&ProgramSequencePatternEvent>,
    ) -> Vec<&ProgramSequencePatternEvent> {
        events.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));
        events
    }

    /// Events of a pattern, sorted by position.
    pub fn events_of_pattern(
        &self,
        pattern_id: ProgramSequencePatternId,
    ) -> Vec<&ProgramSequencePatternEvent> {
        Self::sorted_by_position(
            self.program_sequence_pattern_events
                .values()
                .filter(|e| e.program_sequence_pattern_id == pattern_id)
                .collect(),
        )
    }

    pub fn events_of_pattern_and_track(
        &self,
        pattern_id: ProgramSequencePatternId,
        track_id: ProgramVoiceTrackId,
    ) -> Vec<&ProgramSequencePatternEvent> {
        self.events_of_pattern(pattern_id)
            .into_iter()
            .filter(|e| e.program_voice_track_id == track_id)
            .collect()
    }

    pub fn events_of_program(&self, program_id: ProgramId) -> Vec<&ProgramSequencePatternEvent> {
        Self::sorted_by_position(
            self.program_sequence_pattern_events
                .values()
                .filter(|e| e.program_id == program_id)
                .collect(),
        )
    }

    // -- instruments -------------------------------------------------------------

    pub fn instruments_of_library(&self, library_id: LibraryId) -> Vec<&Instrument> {
        self.instruments
            .values()
            .filter(|i| i.library_id == library_id)
            .collect()
    }

    pub fn instruments_of_type(&self, type_: InstrumentType) -> Vec<&Instrument> {
        self.instruments.values().filter(|i| i.type_ == type_).collect()
    }

    /// Instruments whose type and mode are in the given sets; an empty set
    /// matches everything.
    pub fn instruments_of_types_and_modes(
        &self,
        types: &BTreeSet<InstrumentType>,
        modes: &BTreeSet<InstrumentMode>,
    ) -> Vec<&Instrument> {
        self.instruments
            .values()
            .filter(|i| types.is_empty() || types.contains(&i.type_))
            .filter(|i| modes.is_empty() || modes.contains(&i.mode))
            .collect()
    }

    pub fn has_instruments_of_type_and_mode(
        &self,
        type_: InstrumentType,
        mode: InstrumentMode,
    ) -> bool {
        self.instruments
            .values()
            .any(|i| i.type_ == type_ && i.mode == mode)
    }

    pub fn memes_of_instrument(&self, instrument_id: InstrumentId) -> Vec<&InstrumentMeme> {
        self.instrument_memes
            .values()
            .filter(|m| m.instrument_id == instrument_id)
            .collect()
    }

    pub fn meme_names_of_instrument(&self, instrument_id: InstrumentId) -> BTreeSet<String> {
        self.memes_of_instrument(instrument_id)
            .iter()
            .map(|m| to_meme(&m.name))
            .filter(|m| !m.is_empty())
            .collect()
    }

    pub fn audios_of_instrument(&self, instrument_id: InstrumentId) -> Vec<&InstrumentAudio> {
        self.instrument_audios
            .values()
            .filter(|a| a.instrument_id == instrument_id)
            .collect()
    }

    pub fn audios_of_instrument_types_and_modes(
        &self,
        types: &BTreeSet<InstrumentType>,
        modes: &BTreeSet<InstrumentMode>,
    ) -> Vec<&InstrumentAudio> {
        self.instruments_of_types_and_modes(types, modes)
            .into_iter()
            .flat_map(|i| self.audios_of_instrument(i.id))
            .collect()
    }

    /// The type of the instrument owning an audio. Errors when either is
    /// missing.
    pub fn instrument_type_of_audio(
        &self,
        audio_id: InstrumentAudioId,
    ) -> Result<InstrumentType, ContentError> {
        let audio = self
            .instrument_audios
            .get(&audio_id)
            .ok_or_else(|| ContentError::not_found("InstrumentAudio", audio_id))?;
        self.instruments
            .get(&audio.instrument_id)
            .map(|i| i.type_)
            .ok_or_else(|| ContentError::not_found("Instrument", audio.instrument_id))
    }

    // -- scoping -----------------------------------------------------------------

    /// A new store holding only what `template_id` can reach.
    pub fn for_template(&self, template_id: TemplateId) -> Result<ContentStore, ContentError> {
        let template = self
            .templates
            .get(&template_id)
            .ok_or_else(|| ContentError::not_found("Template", template_id))?;
        let mut scoped = ContentStore::new();
        scoped.insert(template.clone());
        if let Some(project) = self.projects.get(&template.project_id) {
            scoped.insert(project.clone());
        }

        for binding in self.bindings_of_template(template_id) {
            scoped.insert(binding.clone());
            match binding.type_ {
                ContentBindingType::Library => {
                    if let Some(library) = self.libraries.get(&LibraryId(binding.target_id)) {
                        scoped.insert(library.clone());
                    }
                }
                ContentBindingType::Program => {
                    if let Some(program) = self.programs.get(&ProgramId(binding.target_id)) {
                        scoped.insert(program.clone());
                    }
                }
                ContentBindingType::Instrument => {
                    let instrument_id = InstrumentId(binding.target_id);
                    if let Some(instrument) = self.instruments.get(&instrument_id) {
                        scoped.insert(instrument.clone());
                    }
                }
            }
        }

        let library_ids: Vec<LibraryId> = scoped.libraries.keys().copied().collect();
        for library_id in library_ids {
            for program in self.programs_of_library(library_id) {
                if program.state == ProgramState::Published {
                    scoped.insert(program.clone());
                }
            }
            for instrument in self.instruments_of_library(library_id) {
                if instrument.state == InstrumentState::Published {
                    scoped.insert(instrument.clone());
                }
            }
        }

        let program_ids: Vec<ProgramId> = scoped.programs.keys().copied().collect();
        for program_id in program_ids {
            self.copy_program_descendants(program_id, &mut scoped);
        }
        let instrument_ids: Vec<InstrumentId> = scoped.instruments.keys().copied().collect();
        for instrument_id in instrument_ids {
            for meme in self.memes_of_instrument(instrument_id) {
                scoped.insert(meme.clone());
            }
            for audio in self.audios_of_instrument(instrument_id) {
                scoped.insert(audio.clone());
            }
        }

        debug!(
            template = %template.name,
            programs = scoped.programs.len(),
            instruments = scoped.instruments.len(),
            "scoped content to template"
        );
        Ok(scoped)
    }

    fn copy_program_descendants(&self, program_id: ProgramId, into: &mut ContentStore) {
        fn copy<E: ContentEntity>(
            from: &ContentStore,
            into: &mut ContentStore,
            keep: impl Fn(&E) -> bool,
        ) {
            for e in E::table(from).values().filter(|e| keep(*e)) {
                into.insert(e.clone());
            }
        }
        copy::<ProgramMeme>(self, into, |e| e.program_id == program_id);
        copy::<ProgramVoice>(self, into, |e| e.program_id == program_id);
        copy::<ProgramVoiceTrack>(self, into, |e| e.program_id == program_id);
        copy::<ProgramSequence>(self, into, |e| e.program_id == program_id);
        copy::<ProgramSequenceBinding>(self, into, |e| e.program_id == program_id);
        copy::<ProgramSequenceBindingMeme>(self, into, |e| e.program_id == program_id);
        copy::<ProgramSequenceChord>(self, into, |e| e.program_id == program_id);
        copy::<ProgramSequenceChordVoicing>(self, into, |e| e.program_id == program_id);
        copy::<ProgramSequencePattern>(self, into, |e| e.program_id == program_id);
        copy::<ProgramSequencePatternEvent>(self, into, |e| e.program_id == program_id);
    }
}
