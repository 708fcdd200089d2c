// Picks voicing notes for pattern-event notes.
//
// A pattern event says "play E4" in the source program's key and register;
// the segment's chord voicing says which notes are actually available right
// now. The picker maps each event note onto the closest available voicing
// note. With inversion seeking enabled it also considers every octave of
// each voicing pitch class that falls inside the target range, which keeps
// pads and stabs from leaping between chords.
//
// Atonal event notes have no pitch to compare against; they get a random
// voicing note (callers that need stability route atonal notes through a
// sticky bun instead).
//
// The picker remembers the range of everything it has picked so the caller
// can widen its voice-leading range after each event.

use crate::note::Note;
use crate::note_range::NoteRange;
use ostinato_prng::SeededRng;
use smallvec::SmallVec;

pub struct NotePicker {
    target_range: NoteRange,
    voicing_notes: SmallVec<[Note; 8]>,
    seek_inversions: bool,
    picked: NoteRange,
}

impl NotePicker {
    pub fn new(
        target_range: NoteRange,
        voicing_notes: impl IntoIterator<Item = Note>,
        seek_inversions: bool,
    ) -> Self {
        let mut voicing_notes: SmallVec<[Note; 8]> = voicing_notes
            .into_iter()
            .filter(|n| !n.is_atonal())
            .collect();
        voicing_notes.sort();
        voicing_notes.dedup();
        Self {
            target_range,
            voicing_notes,
            seek_inversions,
            picked: NoteRange::empty(),
        }
    }

    /// Map one event note onto the voicing. Returns the event note itself
    /// when the voicing is empty.
    pub fn pick(&mut self, event_note: Note, rng: &mut SeededRng) -> Note {
        if self.voicing_notes.is_empty() {
            return event_note;
        }
        let picked = if event_note.is_atonal() {
            let i = rng.range_usize(0, self.voicing_notes.len());
            self.voicing_notes[i]
        } else {
            self.nearest_candidate(event_note)
        };
        self.picked.expand_note(picked);
        picked
    }

    /// Range of every note picked so far.
    pub fn picked_range(&self) -> &NoteRange {
        &self.picked
    }

    fn nearest_candidate(&self, event_note: Note) -> Note {
        let mut candidates: SmallVec<[Note; 16]> = self.voicing_notes.iter().copied().collect();
        if self.seek_inversions {
            if let (Some(low), Some(high)) = (
                self.target_range.low().and_then(|n| n.semitones()),
                self.target_range.high().and_then(|n| n.semitones()),
            ) {
                for note in &self.voicing_notes {
                    let Some(class) = note.pitch_class().semitone() else {
                        continue;
                    };
                    candidates.extend(
                        (low..=high)
                            .filter(|s| s.rem_euclid(12) == class)
                            .map(Note::of_semitones),
                    );
                }
            }
        }
        // Lowest note wins a distance tie.
        candidates.sort();
        candidates
            .into_iter()
            .min_by_key(|c| event_note.delta(c).abs())
            .unwrap_or(event_note)
    }
}
