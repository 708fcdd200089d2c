// Authoring API for content stores.
//
// `ContentBuilder` mints ids from its own `IdGenerator` and inserts
// entities with their foreign keys filled in, so tests, benches and the demo
// library can describe content without spelling out UUIDs. Child entities
// of a program (tracks, bindings, chords, voicings, patterns, events) look
// up their owning program through the parent they are attached to.
//
// Fields the helpers do not take as arguments keep their `Default` values;
// `edit` adjusts anything else after insertion.
//
// See also: `demo.rs` (a full library built with this API), `store.rs`.

use crate::enums::*;
use crate::ids::*;
use crate::model::*;
use crate::store::{ContentEntity, ContentStore};

pub struct ContentBuilder {
    store: ContentStore,
    ids: IdGenerator,
}

impl ContentBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            store: ContentStore::new(),
            ids: IdGenerator::new(seed),
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn build(self) -> ContentStore {
        self.store
    }

    /// Mutate an already-inserted entity. Unknown ids are ignored.
    pub fn edit<E: ContentEntity>(&mut self, id: E::Id, f: impl FnOnce(&mut E)) -> &mut Self {
        if let Some(entity) = E::table_mut(&mut self.store).get_mut(&id) {
            f(entity);
        }
        self
    }

    // -- project scaffolding ---------------------------------------------------

    pub fn project(&mut self, name: &str) -> ProjectId {
        let id = ProjectId::generate(&mut self.ids);
        self.store.insert(Project {
            id,
            name: name.to_string(),
        })
    }

    pub fn library(&mut self, project_id: ProjectId, name: &str) -> LibraryId {
        let id = LibraryId::generate(&mut self.ids);
        self.store.insert(Library {
            id,
            project_id,
            name: name.to_string(),
        })
    }

    pub fn template(
        &mut self,
        project_id: ProjectId,
        name: &str,
        ship_key: &str,
        config: &str,
    ) -> TemplateId {
        let id = TemplateId::generate(&mut self.ids);
        self.store.insert(Template {
            id,
            project_id,
            name: name.to_string(),
            ship_key: ship_key.to_string(),
            config: config.to_string(),
        })
    }

    pub fn bind_library(
        &mut self,
        template_id: TemplateId,
        library_id: LibraryId,
    ) -> TemplateBindingId {
        self.bind(template_id, ContentBindingType::Library, library_id.uuid())
    }

    pub fn bind_program(
        &mut self,
        template_id: TemplateId,
        program_id: ProgramId,
    ) -> TemplateBindingId {
        self.bind(template_id, ContentBindingType::Program, program_id.uuid())
    }

    pub fn bind_instrument(
        &mut self,
        template_id: TemplateId,
        instrument_id: InstrumentId,
    ) -> TemplateBindingId {
        self.bind(template_id, ContentBindingType::Instrument, instrument_id.uuid())
    }

    fn bind(
        &mut self,
        template_id: TemplateId,
        type_: ContentBindingType,
        target_id: Uuid,
    ) -> TemplateBindingId {
        let id = TemplateBindingId::generate(&mut self.ids);
        self.store.insert(TemplateBinding {
            id,
            template_id,
            type_,
            target_id,
        })
    }

    // -- programs ----------------------------------------------------------------

    /// A published program.
    pub fn program(
        &mut self,
        library_id: LibraryId,
        type_: ProgramType,
        name: &str,
        key: &str,
        tempo: f64,
    ) -> ProgramId {
        let id = ProgramId::generate(&mut self.ids);
        self.store.insert(Program {
            id,
            library_id,
            state: ProgramState::Published,
            type_,
            key: key.to_string(),
            tempo,
            name: name.to_string(),
            config: String::new(),
        })
    }

    pub fn program_meme(&mut self, program_id: ProgramId, name: &str) -> ProgramMemeId {
        let id = ProgramMemeId::generate(&mut self.ids);
        self.store.insert(ProgramMeme {
            id,
            program_id,
            name: name.to_string(),
        })
    }

    pub fn voice(
        &mut self,
        program_id: ProgramId,
        type_: InstrumentType,
        name: &str,
    ) -> ProgramVoiceId {
        let id = ProgramVoiceId::generate(&mut self.ids);
        let order = self.store.voices_of_program(program_id).len() as f64;
        self.store.insert(ProgramVoice {
            id,
            program_id,
            type_,
            name: name.to_string(),
            order,
        })
    }

    pub fn track(&mut self, voice_id: ProgramVoiceId, name: &str) -> ProgramVoiceTrackId {
        let id = ProgramVoiceTrackId::generate(&mut self.ids);
        let program_id = self.program_of_voice(voice_id);
        let order = self.store.tracks_of_voice(voice_id).len() as f64;
        self.store.insert(ProgramVoiceTrack {
            id,
            program_id,
            program_voice_id: voice_id,
            name: name.to_string(),
            order,
        })
    }

    pub fn sequence(
        &mut self,
        program_id: ProgramId,
        name: &str,
        key: &str,
        total: u32,
        intensity: f64,
    ) -> ProgramSequenceId {
        let id = ProgramSequenceId::generate(&mut self.ids);
        self.store.insert(ProgramSequence {
            id,
            program_id,
            name: name.to_string(),
            key: key.to_string(),
            total,
            intensity,
        })
    }

    pub fn sequence_binding(
        &mut self,
        sequence_id: ProgramSequenceId,
        offset: i32,
    ) -> ProgramSequenceBindingId {
        let id = ProgramSequenceBindingId::generate(&mut self.ids);
        let program_id = self.program_of_sequence(sequence_id);
        self.store.insert(ProgramSequenceBinding {
            id,
            program_id,
            program_sequence_id: sequence_id,
            offset,
        })
    }

    pub fn binding_meme(
        &mut self,
        binding_id: ProgramSequenceBindingId,
        name: &str,
    ) -> ProgramSequenceBindingMemeId {
        let id = ProgramSequenceBindingMemeId::generate(&mut self.ids);
        let program_id = self
            .store
            .get::<ProgramSequenceBinding>(binding_id)
            .map(|b| b.program_id)
            .unwrap_or_default();
        self.store.insert(ProgramSequenceBindingMeme {
            id,
            program_id,
            program_sequence_binding_id: binding_id,
            name: name.to_string(),
        })
    }

    pub fn chord(
        &mut self,
        sequence_id: ProgramSequenceId,
        name: &str,
        position: f64,
    ) -> ProgramSequenceChordId {
        let id = ProgramSequenceChordId::generate(&mut self.ids);
        let program_id = self.program_of_sequence(sequence_id);
        self.store.insert(ProgramSequenceChord {
            id,
            program_id,
            program_sequence_id: sequence_id,
            name: name.to_string(),
            position,
        })
    }

    pub fn voicing(
        &mut self,
        chord_id: ProgramSequenceChordId,
        voice_id: ProgramVoiceId,
        notes: &str,
    ) -> ProgramSequenceChordVoicingId {
        let id = ProgramSequenceChordVoicingId::generate(&mut self.ids);
        let program_id = self.program_of_voice(voice_id);
        self.store.insert(ProgramSequenceChordVoicing {
            id,
            program_id,
            program_sequence_chord_id: chord_id,
            program_voice_id: voice_id,
            notes: notes.to_string(),
        })
    }

    pub fn pattern(
        &mut self,
        sequence_id: ProgramSequenceId,
        voice_id: ProgramVoiceId,
        name: &str,
        total: u32,
    ) -> ProgramSequencePatternId {
        let id = ProgramSequencePatternId::generate(&mut self.ids);
        let program_id = self.program_of_sequence(sequence_id);
        self.store.insert(ProgramSequencePattern {
            id,
            program_id,
            program_sequence_id: sequence_id,
            program_voice_id: voice_id,
            name: name.to_string(),
            total,
        })
    }

    /// An event at full velocity.
    pub fn event(
        &mut self,
        pattern_id: ProgramSequencePatternId,
        track_id: ProgramVoiceTrackId,
        position: f64,
        duration: f64,
        tones: &str,
    ) -> ProgramSequencePatternEventId {
        let id = ProgramSequencePatternEventId::generate(&mut self.ids);
        let program_id = self
            .store
            .get::<ProgramSequencePattern>(pattern_id)
            .map(|p| p.program_id)
            .unwrap_or_default();
        self.store.insert(ProgramSequencePatternEvent {
            id,
            program_id,
            program_sequence_pattern_id: pattern_id,
            program_voice_track_id: track_id,
            velocity: 1.0,
            position,
            duration,
            tones: tones.to_string(),
        })
    }

    fn program_of_voice(&self, voice_id: ProgramVoiceId) -> ProgramId {
        self.store
            .get::<ProgramVoice>(voice_id)
            .map(|v| v.program_id)
            .unwrap_or_default()
    }

    fn program_of_sequence(&self, sequence_id: ProgramSequenceId) -> ProgramId {
        self.store
            .get::<ProgramSequence>(sequence_id)
            .map(|s| s.program_id)
            .unwrap_or_default()
    }

    // -- instruments ---------------------------------------------------------------

    /// A published instrument at unit volume.
    pub fn instrument(
        &mut self,
        library_id: LibraryId,
        type_: InstrumentType,
        mode: InstrumentMode,
        name: &str,
    ) -> InstrumentId {
        let id = InstrumentId::generate(&mut self.ids);
        self.store.insert(Instrument {
            id,
            library_id,
            type_,
            mode,
            state: InstrumentState::Published,
            name: name.to_string(),
            volume: 1.0,
            config: String::new(),
        })
    }

    pub fn instrument_meme(&mut self, instrument_id: InstrumentId, name: &str) -> InstrumentMemeId {
        let id = InstrumentMemeId::generate(&mut self.ids);
        self.store.insert(InstrumentMeme {
            id,
            instrument_id,
            name: name.to_string(),
        })
    }

    /// An audio answering to `event` with tonal label `tones`. Waveform key
    /// is derived from the name; tempo, length and intensity take neutral
    /// defaults.
    pub fn audio(
        &mut self,
        instrument_id: InstrumentId,
        name: &str,
        event: &str,
        tones: &str,
    ) -> InstrumentAudioId {
        let id = InstrumentAudioId::generate(&mut self.ids);
        self.store.insert(InstrumentAudio {
            id,
            instrument_id,
            name: name.to_string(),
            waveform_key: format!("{}.wav", name.to_lowercase().replace(' ', "-")),
            transient_seconds: 0.0,
            loop_beats: 4.0,
            tempo: 120.0,
            intensity: 0.5,
            event: event.to_string(),
            volume: 1.0,
            tones: tones.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_inherit_program_id() {
        let mut b = ContentBuilder::new(1);
        let project = b.project("P");
        let library = b.library(project, "L");
        let program = b.program(library, ProgramType::Beat, "Beat", "C", 120.0);
        let voice = b.voice(program, InstrumentType::Drum, "Drums");
        let track = b.track(voice, "KICK");
        let sequence = b.sequence(program, "Loop", "C", 4, 0.5);
        let pattern = b.pattern(sequence, voice, "Basic", 4);
        let event = b.event(pattern, track, 0.0, 1.0, "X");
        let store = b.build();

        assert_eq!(store.get::<ProgramVoiceTrack>(track).unwrap().program_id, program);
        assert_eq!(store.get::<ProgramSequencePattern>(pattern).unwrap().program_id, program);
        assert_eq!(
            store.get::<ProgramSequencePatternEvent>(event).unwrap().program_id,
            program
        );
    }

    #[test]
    fn edit_changes_inserted_entity() {
        let mut b = ContentBuilder::new(2);
        let project = b.project("P");
        let library = b.library(project, "L");
        let program = b.program(library, ProgramType::Main, "Main", "C", 120.0);
        b.edit::<Program>(program, |p| p.config = "{\"barBeats\": 3}".to_string());
        assert_eq!(b.store().get::<Program>(program).unwrap().config, "{\"barBeats\": 3}");
    }

    #[test]
    fn same_seed_builds_same_ids() {
        let build = |seed| {
            let mut b = ContentBuilder::new(seed);
            let project = b.project("P");
            b.library(project, "L")
        };
        assert_eq!(build(5), build(5));
        assert_ne!(build(5), build(6));
    }
}
