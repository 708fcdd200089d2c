// CraftWork: one synchronous "fabricate the next segment" step.
//
// `start` scopes the content to one template and opens a chain from it
// (name, ship key and config copied from the template). Each call to
// `fabricate_next` then:
// 1. plans the next gap-free segment, beginning where the last one ends
// 2. moves it to Crafting and builds its fabricator
// 3. runs macro/main, beat and detail craft, in that order
// 4. fills in the ship key and moves the segment to Crafted
// 5. prunes segments older than the retention window
//
// A failing step leaves an error message on the segment, moves it to
// Failed and returns the error. Nothing is retried; a Failed segment ends
// the chain, since its successor cannot be planned without a duration.
//
// `rewrite` replaces the chain's future from a point in chain time: the
// segment playing there is cut short at the next cutoff boundary, every
// later segment is deleted, and the next segment is fabricated as NextMacro
// with the rewrite's macro program and memes forced on it.
//
// See also: `factory.rs`, `craft/mod.rs`, `craft/macro_main.rs` (overrides).

use crate::craft::{BeatCraft, DetailCraft, MacroMainCraft};
use crate::enums::{ChainState, SegmentState, SegmentType};
use crate::error::FabricationError;
use crate::factory::FabricatorFactory;
use crate::fabricator::Fabricator;
use crate::segment::{Chain, ChainId, Segment, SegmentChoiceArrangementPick, SegmentId};
use crate::segment_store::SegmentStore;
use ostinato_content::enums::ProgramType;
use ostinato_content::ids::ProgramId;
use ostinato_content::model::Program;
use ostinato_content::{ContentError, ContentStore, IdGenerator, ProgramConfig};
use ostinato_prng::SeededRng;
use std::collections::BTreeSet;
use tracing::{error, info, warn};

const MICROS_PER_MINUTE: f64 = 60_000_000.0;

/// Segments kept in the store, counting the newest one.
pub const DEFAULT_RETENTION: u32 = 64;

/// What a rewrite forces onto the first re-fabricated segment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rewrite {
    pub macro_program: Option<ProgramId>,
    pub memes: BTreeSet<String>,
}

pub struct CraftWork {
    content: ContentStore,
    store: SegmentStore,
    factory: FabricatorFactory,
    retention: u32,
}

impl CraftWork {
    /// Open a chain on the template matching `template_identifier` (name,
    /// ship key or id), or on the first template when none is given.
    pub fn start(
        content: &ContentStore,
        template_identifier: Option<&str>,
        factory: FabricatorFactory,
    ) -> Result<Self, FabricationError> {
        let template = match template_identifier {
            Some(identifier) => content.template_by_identifier(identifier),
            None => content.first_template(),
        }
        .ok_or_else(|| {
            ContentError::not_found("Template", template_identifier.unwrap_or("<first>"))
        })?;

        let mut ids = IdGenerator::new(SeededRng::derive_seed(&[factory.seed, 0xC4A1]));
        let chain = Chain {
            id: ChainId::generate(&mut ids),
            template_id: template.id,
            state: ChainState::Fabricate,
            name: template.name.clone(),
            ship_key: template.ship_key.clone(),
            config: template.config.clone(),
            ..Default::default()
        };
        let mut store = SegmentStore::new();
        store.put_chain(chain)?;
        info!(template = %template.name, ship_key = %template.ship_key, "started chain");

        Ok(Self {
            content: content.for_template(template.id)?,
            store,
            factory,
            retention: DEFAULT_RETENTION,
        })
    }

    /// Keep at most `segments` segments (at least one) in the store.
    pub fn with_retention(mut self, segments: u32) -> Self {
        self.retention = segments.max(1);
        self
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn chain(&self) -> Result<&Chain, FabricationError> {
        self.store.chain()
    }

    pub fn fabricate_next(&mut self) -> Result<SegmentId, FabricationError> {
        self.fabricate(None, &Rewrite::default())
    }

    /// Fabricate the next segment, forcing its type when `type_override`
    /// is given.
    pub fn fabricate_next_as(
        &mut self,
        type_override: Option<SegmentType>,
    ) -> Result<SegmentId, FabricationError> {
        self.fabricate(type_override, &Rewrite::default())
    }

    /// Cut the segment playing at `at_chain_micros` short, drop everything
    /// after it and fabricate a NextMacro segment carrying `rewrite`.
    ///
    /// Returns `None`, changing nothing, when no crafted segment with a main
    /// program plays at that time.
    pub fn rewrite(
        &mut self,
        at_chain_micros: i64,
        rewrite: &Rewrite,
    ) -> Result<Option<SegmentId>, FabricationError> {
        self.check_macro_program(rewrite)?;
        let Some(current) = self.store.read_segment_at_chain_micros(at_chain_micros).cloned() else {
            warn!(at_chain_micros, "nothing fabricated there, not rewriting");
            return Ok(None);
        };
        if current.state != SegmentState::Crafted {
            warn!(
                segment_id = current.id.0,
                state = %current.state,
                "segment is not crafted, not rewriting"
            );
            return Ok(None);
        }
        let Some(program) = self
            .store
            .read_choice(current.id, ProgramType::Main)
            .and_then(|c| c.program_id)
            .and_then(|id| self.content.get::<Program>(id))
        else {
            warn!(segment_id = current.id.0, "segment has no main program, not rewriting");
            return Ok(None);
        };
        let tempo = program.tempo;
        if tempo <= 0.0 {
            return Err(FabricationError::Configuration {
                subject: program.id.to_string(),
                reason: format!("tempo {tempo} must be positive"),
            });
        }
        let config = ProgramConfig::parse(&program.config)?;

        let elapsed = at_chain_micros - current.begin_at_chain_micros;
        let cutoff = cutoff_beats(&config, tempo, elapsed);
        if cutoff < current.total as f64 {
            self.cut_short(current.id, cutoff, tempo)?;
        }

        let removed = self.store.delete_segments_after(current.id);
        if rewrite.macro_program.is_none() && rewrite.memes.is_empty() {
            warn!(segment_id = current.id.0, "rewrite carries neither a macro program nor memes");
        }
        info!(
            segment_id = current.id.0,
            removed,
            macro_program = ?rewrite.macro_program,
            memes = ?rewrite.memes,
            "rewriting chain"
        );
        self.fabricate(Some(SegmentType::NextMacro), rewrite).map(Some)
    }

    fn check_macro_program(&self, rewrite: &Rewrite) -> Result<(), FabricationError> {
        match rewrite.macro_program {
            Some(id) => match self.content.get::<Program>(id) {
                None => Err(ContentError::not_found("Program", id).into()),
                Some(program) if program.type_ != ProgramType::Macro => {
                    Err(FabricationError::Configuration {
                        subject: id.to_string(),
                        reason: format!("{} program cannot override the macro", program.type_),
                    })
                }
                Some(_) => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn fabricate(
        &mut self,
        type_override: Option<SegmentType>,
        rewrite: &Rewrite,
    ) -> Result<SegmentId, FabricationError> {
        self.check_macro_program(rewrite)?;
        let id = self.plan_next()?;
        self.store.update_segment_state(id, SegmentState::Crafting)?;

        let content = &self.content;
        let macro_program = rewrite.macro_program.and_then(|p| content.get::<Program>(p));
        let outcome = match self.factory.fabricator(content, &mut self.store, id, type_override) {
            Ok(mut fab) => {
                let outcome = Self::craft(&mut fab, macro_program, &rewrite.memes);
                if let Err(e) = &outcome
                    && let Err(note) =
                        fab.add_error_message(&format!("Failed to fabricate {id}: {e}"))
                {
                    warn!(segment_id = id.0, error = %note, "could not record failure");
                }
                outcome
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.store.update_segment_state(id, SegmentState::Crafted)?;
                if let Some(segment) = self.store.read_segment(id) {
                    info!(
                        segment_id = id.0,
                        segment_type = %segment.type_,
                        key = %segment.key,
                        tempo = segment.tempo,
                        total = segment.total,
                        "crafted segment"
                    );
                }
                self.prune(id);
                Ok(id)
            }
            Err(e) => {
                error!(segment_id = id.0, error = %e, "segment failed");
                self.store.update_segment_state(id, SegmentState::Failed)?;
                Err(e)
            }
        }
    }

    /// Create the next segment in `Planned`.
    fn plan_next(&mut self) -> Result<SegmentId, FabricationError> {
        let chain_id = self.store.chain()?.id;
        let (id, begin) = match self.store.read_segment_last() {
            Some(last) => {
                let end = last.end_at_chain_micros().ok_or_else(|| FabricationError::Configuration {
                    subject: last.id.to_string(),
                    reason: format!("{} segment has no duration to follow", last.state),
                })?;
                (last.id.next(), end)
            }
            None => (SegmentId(0), 0),
        };
        self.store.create_segment(Segment {
            id,
            chain_id,
            state: SegmentState::Planned,
            begin_at_chain_micros: begin,
            ..Default::default()
        })?;
        Ok(id)
    }

    fn craft<'a>(
        fab: &mut Fabricator<'a>,
        macro_program: Option<&'a Program>,
        memes: &BTreeSet<String>,
    ) -> Result<(), FabricationError> {
        let mut macro_main = MacroMainCraft::new(fab);
        if let Some(program) = macro_program {
            macro_main = macro_main.with_override_macro_program(program);
        }
        if !memes.is_empty() {
            macro_main = macro_main.with_override_memes(memes.clone());
        }
        macro_main.do_work()?;
        BeatCraft::new(fab).do_work()?;
        DetailCraft::new(fab).do_work()?;
        fab.ensure_ship_key()
    }

    /// Shorten a crafted segment to `beats`, dropping picks that start
    /// after the new end and trimming those that ring past it.
    fn cut_short(&mut self, id: SegmentId, beats: f64, tempo: f64) -> Result<(), FabricationError> {
        let duration = (beats * MICROS_PER_MINUTE / tempo) as i64;
        self.store.update_segment_state(id, SegmentState::Crafting)?;
        let mut segment = self
            .store
            .read_segment(id)
            .cloned()
            .ok_or_else(|| FabricationError::not_found(id.to_string()))?;
        segment.total = beats as u32;
        segment.duration_micros = Some(duration);
        self.store.update_segment(segment)?;

        let picks: Vec<SegmentChoiceArrangementPick> = self
            .store
            .read_all::<SegmentChoiceArrangementPick>(id)
            .into_iter()
            .cloned()
            .collect();
        for pick in picks {
            if pick.start_at_segment_micros >= duration {
                self.store.delete::<SegmentChoiceArrangementPick>(id, pick.id)?;
            } else if let Some(length) = pick.length_micros
                && length > 0
                && pick.start_at_segment_micros + length > duration
            {
                let length_micros = Some(duration - pick.start_at_segment_micros);
                self.store.put(SegmentChoiceArrangementPick { length_micros, ..pick })?;
            }
        }
        self.store.update_segment_state(id, SegmentState::Crafted)?;
        info!(segment_id = id.0, beats, duration_micros = duration, "cut segment short");
        Ok(())
    }

    fn prune(&mut self, newest: SegmentId) {
        let oldest_kept = newest.0.saturating_sub(self.retention - 1);
        if oldest_kept > 0 {
            self.store.delete_segments_before(SegmentId(oldest_kept));
        }
    }
}

/// Beats after which a segment played up to `elapsed_micros` may end: the
/// next boundary of a cutoff unit, one unit at least. A unit is
/// `cutoffMinimumBeats` rounded up to whole bars, one bar at least.
fn cutoff_beats(config: &ProgramConfig, tempo: f64, elapsed_micros: i64) -> f64 {
    let bar = config.bar_beats as f64;
    let unit = bar * (config.cutoff_minimum_beats / bar).ceil().max(1.0);
    let elapsed_beats = elapsed_micros.max(0) as f64 * tempo / MICROS_PER_MINUTE;
    (unit * (elapsed_beats / unit).ceil()).max(unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::SegmentMessageType;
    use crate::segment::{SegmentMeme, SegmentMessage};
    use ostinato_content::demo::demo_library;
    use ostinato_content::ContentBuilder;

    #[test]
    fn start_copies_template_into_chain() {
        let content = demo_library();
        let work = CraftWork::start(&content, None, FabricatorFactory::new(3)).unwrap();
        let template = content.first_template().unwrap();
        let chain = work.chain().unwrap();
        assert_eq!(chain.template_id, template.id);
        assert_eq!(chain.name, template.name);
        assert_eq!(chain.ship_key, template.ship_key);
        assert_eq!(chain.config, template.config);
        assert_eq!(chain.state, ChainState::Fabricate);
    }

    #[test]
    fn start_rejects_unknown_template() {
        let content = demo_library();
        let result =
            CraftWork::start(&content, Some("no such template"), FabricatorFactory::default());
        assert!(matches!(result, Err(FabricationError::Content(_))));
    }

    #[test]
    fn segments_follow_each_other_without_gaps() {
        let content = demo_library();
        let mut work = CraftWork::start(&content, None, FabricatorFactory::new(5)).unwrap();
        for _ in 0..3 {
            work.fabricate_next().unwrap();
        }
        let store = work.store();
        let segments = store.read_segments_from_to_offset(SegmentId(0), SegmentId(2));
        assert_eq!(segments.len(), 3);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end_at_chain_micros(), Some(pair[1].begin_at_chain_micros));
        }
        for segment in &segments {
            assert_eq!(segment.state, SegmentState::Crafted);
            assert!(!segment.storage_key.is_empty());
            assert!(store.read_choice(segment.id, ProgramType::Main).is_some());
        }
        assert_eq!(segments[0].type_, SegmentType::Initial);
    }

    #[test]
    fn missing_main_program_fails_the_segment() {
        let mut b = ContentBuilder::new(9);
        let project = b.project("P");
        let library = b.library(project, "L");
        let template = b.template(project, "T", "t", "");
        b.bind_library(template, library);
        let macro_program = b.program(library, ProgramType::Macro, "Macro", "C", 120.0);
        let sequence = b.sequence(macro_program, "M", "", 0, 0.5);
        b.sequence_binding(sequence, 0);
        let content = b.build();

        let mut work = CraftWork::start(&content, Some("T"), FabricatorFactory::default()).unwrap();
        let result = work.fabricate_next();
        assert!(matches!(result, Err(FabricationError::NoCandidates { .. })));

        let store = work.store();
        let segment = store.read_segment(SegmentId(0)).unwrap();
        assert_eq!(segment.state, SegmentState::Failed);
        let errors: Vec<&SegmentMessage> = store
            .read_all::<SegmentMessage>(SegmentId(0))
            .into_iter()
            .filter(|m| m.type_ == SegmentMessageType::Error)
            .collect();
        assert!(errors.iter().any(|m| m.body.starts_with("Failed to fabricate")));
        // A failed segment has no duration, so the chain cannot go on.
        assert!(work.fabricate_next().is_err());
    }

    #[test]
    fn same_seed_fabricates_the_same_chain() {
        let content = demo_library();
        let run = |seed| {
            let mut work = CraftWork::start(&content, None, FabricatorFactory::new(seed)).unwrap();
            let id = work.fabricate_next().unwrap();
            let store = work.store();
            let segment = store.read_segment(id).unwrap().clone();
            (segment.key, segment.tempo, segment.total, store.read_choice_hash(id))
        };
        assert_eq!(run(11), run(11));
    }

    #[test]
    fn cutoff_rounds_up_to_whole_units() {
        let config = ProgramConfig::default();
        // 120 bpm: 500 ms per beat.
        assert_eq!(cutoff_beats(&config, 120.0, 0), 4.0);
        assert_eq!(cutoff_beats(&config, 120.0, 500_000), 4.0);
        assert_eq!(cutoff_beats(&config, 120.0, 2_000_000), 4.0);
        assert_eq!(cutoff_beats(&config, 120.0, 2_250_000), 8.0);
        let long = ProgramConfig {
            cutoff_minimum_beats: 6.0,
            ..ProgramConfig::default()
        };
        assert_eq!(cutoff_beats(&long, 120.0, 500_000), 8.0);
    }

    #[test]
    fn rewrite_cuts_the_playing_segment_and_restarts_the_macro() {
        let content = demo_library();
        let mut work = CraftWork::start(&content, None, FabricatorFactory::new(7)).unwrap();
        for _ in 0..3 {
            work.fabricate_next().unwrap();
        }
        let playing = work.store().read_segment(SegmentId(1)).cloned().unwrap();
        assert_eq!(playing.total, 16);

        let rewrite = Rewrite {
            memes: BTreeSet::from(["Summer".to_string()]),
            ..Default::default()
        };
        let id = work
            .rewrite(playing.begin_at_chain_micros + 1, &rewrite)
            .unwrap()
            .unwrap();
        assert_eq!(id, SegmentId(2));

        let store = work.store();
        let cut = store.read_segment(SegmentId(1)).unwrap();
        let duration = (4.0 * MICROS_PER_MINUTE / playing.tempo) as i64;
        assert_eq!(cut.state, SegmentState::Crafted);
        assert_eq!(cut.total, 4);
        assert_eq!(cut.duration_micros, Some(duration));
        for pick in store.read_all::<SegmentChoiceArrangementPick>(SegmentId(1)) {
            assert!(pick.start_at_segment_micros < duration);
            if let Some(length) = pick.length_micros.filter(|l| *l > 0) {
                assert!(pick.start_at_segment_micros + length <= duration);
            }
        }

        let next = store.read_segment(id).unwrap();
        assert_eq!(next.type_, SegmentType::NextMacro);
        assert_eq!(next.delta, 0);
        assert_eq!(Some(next.begin_at_chain_micros), cut.end_at_chain_micros());
        assert!(store
            .read_all::<SegmentMeme>(id)
            .iter()
            .any(|m| m.name == "SUMMER"));
        assert_eq!(store.segment_count(), 3);
        assert_eq!(work.fabricate_next().unwrap(), SegmentId(3));
    }

    #[test]
    fn rewrite_past_the_chain_changes_nothing() {
        let content = demo_library();
        let mut work = CraftWork::start(&content, None, FabricatorFactory::new(8)).unwrap();
        assert_eq!(work.rewrite(0, &Rewrite::default()).unwrap(), None);
        work.fabricate_next().unwrap();
        let end = work.store().read_segment(SegmentId(0)).unwrap().end_at_chain_micros().unwrap();
        assert_eq!(work.rewrite(end, &Rewrite::default()).unwrap(), None);
        assert_eq!(work.store().segment_count(), 1);
    }

    #[test]
    fn rewrite_with_unknown_macro_program_plans_nothing() {
        let content = demo_library();
        let mut work = CraftWork::start(&content, None, FabricatorFactory::new(9)).unwrap();
        work.fabricate_next().unwrap();
        let rewrite = Rewrite {
            macro_program: Some(ProgramId::generate(&mut IdGenerator::new(404))),
            ..Default::default()
        };
        assert!(matches!(work.rewrite(1, &rewrite), Err(FabricationError::Content(_))));
        assert_eq!(work.store().segment_count(), 1);
        assert_eq!(work.store().read_segment(SegmentId(0)).unwrap().total, 16);
    }

    #[test]
    fn rewrite_refuses_a_main_program_as_macro() {
        let content = demo_library();
        let mut work = CraftWork::start(&content, None, FabricatorFactory::new(9)).unwrap();
        work.fabricate_next().unwrap();
        let main = work
            .store()
            .read_choice(SegmentId(0), ProgramType::Main)
            .and_then(|c| c.program_id);
        let rewrite = Rewrite {
            macro_program: main,
            ..Default::default()
        };
        let result = work.rewrite(1, &rewrite);
        assert!(matches!(result, Err(FabricationError::Configuration { .. })));
        assert_eq!(work.store().segment_count(), 1);
    }

    #[test]
    fn old_segments_are_pruned_past_the_retention_window() {
        let content = demo_library();
        let mut work = CraftWork::start(&content, None, FabricatorFactory::new(10))
            .unwrap()
            .with_retention(3);
        for _ in 0..6 {
            work.fabricate_next().unwrap();
        }
        let store = work.store();
        assert_eq!(store.segment_count(), 3);
        assert!(store.read_segment(SegmentId(2)).is_none());
        assert!(store.read_segment(SegmentId(3)).is_some());
        assert!(store.read_all::<SegmentChoiceArrangementPick>(SegmentId(2)).is_empty());
        assert_eq!(work.fabricate_next().unwrap(), SegmentId(6));
    }
}
