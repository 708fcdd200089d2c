// DetailCraft: every non-drum layer, one instrument type at a time.
//
// The template's `detailLayerOrder` names the instrument types to craft, in
// order. Each type keeps the instrument it played in a continued segment,
// else gets a fresh one, and is then crafted by that instrument's mode:
// - Event: voices of a Detail program with a voice of the type
// - Chord: one audio per chord section
// - Loop: intensity-layer audios repeated to the segment end
//
// Layers enter on a delta arc keyed by instrument type.
//
// See also: `craft/mod.rs` (`craft_event_parts`, `craft_chord_parts`,
// `craft_loop_parts`).

use super::Craft;
use crate::error::FabricationError;
use crate::fabricator::Fabricator;
use crate::segment::SegmentChoice;
use ostinato_content::enums::{InstrumentMode, InstrumentType, ProgramType};
use ostinato_content::model::{Instrument, Program};
use ostinato_content::ContentStore;
use std::collections::BTreeSet;
use tracing::debug;

fn instrument_type_of(_: &ContentStore, choice: &SegmentChoice) -> String {
    choice.instrument_type.map(|t| t.as_str().to_string()).unwrap_or_default()
}

fn is_detail_choice(choice: &SegmentChoice) -> bool {
    choice.instrument_type.is_some_and(|t| t != InstrumentType::Drum)
        && !matches!(
            choice.program_type,
            Some(ProgramType::Macro | ProgramType::Main | ProgramType::Beat)
        )
}

pub struct DetailCraft<'f, 'a> {
    craft: Craft<'f, 'a>,
}

impl<'f, 'a> DetailCraft<'f, 'a> {
    pub fn new(fab: &'f mut Fabricator<'a>) -> Self {
        Self { craft: Craft::new(fab) }
    }

    pub fn do_work(mut self) -> Result<(), FabricationError> {
        let config = self.craft.fab.template_config();
        let order = config.detail_layer_order.clone();
        let incoming = config.delta_arc_detail_layers_incoming;
        let layers: Vec<String> = order.iter().map(|t| t.as_str().to_string()).collect();
        let tempo = self.craft.fab.segment()?.tempo;

        self.craft
            .precompute_deltas(is_detail_choice, instrument_type_of, &layers, &[], incoming)?;

        for type_ in order {
            let Some(instrument) = self.instrument_for(type_)? else {
                debug!(segment_id = self.craft.fab.segment_id().0, %type_, "no detail instrument");
                continue;
            };
            match instrument.mode {
                InstrumentMode::Event => {
                    let Some(program) = self.detail_program(type_)? else {
                        debug!(%type_, "no detail program");
                        continue;
                    };
                    self.craft.craft_event_parts(tempo, instrument, program)?;
                }
                InstrumentMode::Chord => self.craft.craft_chord_parts(tempo, instrument)?,
                InstrumentMode::Loop => self.craft.craft_loop_parts(tempo, instrument)?,
            }
        }
        Ok(())
    }

    /// The instrument a continued segment already plays for `type_`, else
    /// a fresh one.
    fn instrument_for(
        &mut self,
        type_: InstrumentType,
    ) -> Result<Option<&'a Instrument>, FabricationError> {
        let content = self.craft.fab.content();
        let continued = self
            .craft
            .fab
            .choice_if_continued_instrument_type(type_)?
            .and_then(|c| c.instrument_id)
            .and_then(|id| content.get::<Instrument>(id));
        match continued {
            Some(instrument) => Ok(Some(instrument)),
            None => self.craft.choose_fresh_instrument(type_, &BTreeSet::new()),
        }
    }

    fn detail_program(
        &mut self,
        type_: InstrumentType,
    ) -> Result<Option<&'a Program>, FabricationError> {
        let content = self.craft.fab.content();
        let continued = self
            .craft
            .fab
            .choices_if_continued(ProgramType::Detail)?
            .into_iter()
            .filter(|c| c.instrument_type == Some(type_))
            .find_map(|c| c.program_id)
            .and_then(|id| content.get::<Program>(id));
        match continued {
            Some(program) => Ok(Some(program)),
            None => self.craft.choose_fresh_program(ProgramType::Detail, Some(type_)),
        }
    }
}
