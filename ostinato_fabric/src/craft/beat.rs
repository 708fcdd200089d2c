// BeatCraft: the drum layer.
//
// Plays one Beat program per segment, continuing the previous one when the
// segment continues, and gives each of its voices a Drum instrument whose
// audio events cover the voice's track names. Voices enter on a delta arc
// keyed by voice name, with the template's prioritised layers (kick, by
// default) first.
//
// See also: `craft/mod.rs` (`craft_note_events`, `precompute_deltas`).

use super::Craft;
use crate::error::FabricationError;
use crate::fabricator::Fabricator;
use crate::segment::SegmentChoice;
use ostinato_content::enums::{InstrumentType, ProgramType};
use ostinato_content::model::{Program, ProgramVoice};
use ostinato_content::ContentStore;
use tracing::debug;

/// The voice name a beat choice belongs to.
fn voice_name_of(content: &ContentStore, choice: &SegmentChoice) -> String {
    choice
        .program_voice_id
        .and_then(|id| content.get::<ProgramVoice>(id))
        .map(|v| v.name.clone())
        .unwrap_or_default()
}

fn is_beat_choice(choice: &SegmentChoice) -> bool {
    choice.program_type == Some(ProgramType::Beat)
}

pub struct BeatCraft<'f, 'a> {
    craft: Craft<'f, 'a>,
}

impl<'f, 'a> BeatCraft<'f, 'a> {
    pub fn new(fab: &'f mut Fabricator<'a>) -> Self {
        Self { craft: Craft::new(fab) }
    }

    pub fn do_work(mut self) -> Result<(), FabricationError> {
        let Some(program) = self.beat_program()? else {
            debug!(segment_id = self.craft.fab.segment_id().0, "no beat program");
            return Ok(());
        };
        let fab = &mut *self.craft.fab;
        let content = fab.content();
        let Some(sequence) = fab.randomly_selected_sequence(program.id) else {
            return Ok(());
        };
        let voices = content.voices_of_program(program.id);
        let layers: Vec<String> = voices.iter().map(|v| v.name.clone()).collect();
        let config = fab.template_config();
        let prioritize = config.delta_arc_beat_layers_to_prioritize.clone();
        let incoming = config.delta_arc_beat_layers_incoming;
        let tempo = fab.segment()?.tempo;

        self.craft
            .precompute_deltas(is_beat_choice, voice_name_of, &layers, &prioritize, incoming)?;
        self.craft
            .craft_note_events(tempo, sequence, &voices, true, |craft, voice| {
                let events = content.track_names_of_voice(voice.id);
                craft.choose_fresh_instrument(InstrumentType::Drum, &events)
            })
    }

    /// The continued beat program, else a fresh one with a drum voice.
    fn beat_program(&mut self) -> Result<Option<&'a Program>, FabricationError> {
        let content = self.craft.fab.content();
        let continued = self
            .craft
            .fab
            .choices_if_continued(ProgramType::Beat)?
            .into_iter()
            .find_map(|c| c.program_id)
            .and_then(|id| content.get::<Program>(id));
        match continued {
            Some(program) => Ok(Some(program)),
            None => self
                .craft
                .choose_fresh_program(ProgramType::Beat, Some(InstrumentType::Drum)),
        }
    }
}
