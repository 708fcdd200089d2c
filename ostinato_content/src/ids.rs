// Deterministic entity identifiers.
//
// Every content and segment entity is keyed by a strongly-typed UUID v4
// wrapper (`ProgramId`, `InstrumentAudioId`, ...). Ids are minted by an
// explicit `IdGenerator` handed to whoever creates entities; there is no
// process-wide counter. Two generators seeded alike mint the same ids in the
// same order, which is what makes fabrication reproducible.
//
// Ids serialize as the usual 8-4-4-4-12 lowercase hex string, so they can be
// JSON map keys and round-trip through content files.
//
// **Critical constraint: determinism.** Ids come from `SeededRng` only. Do
// not use external UUID libraries or OS entropy.
//
// See also: `ostinato_prng` for the generator, `model.rs` for the entities
// these ids key.

use ostinato_prng::SeededRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// ---------------------------------------------------------------------------
// Uuid
// ---------------------------------------------------------------------------

/// A UUID v4 generated from a `SeededRng`.
///
/// Layout follows RFC 4122: version nibble (byte 6) is `0100` and variant
/// bits (byte 8) are `10`. The all-zero nil UUID marks "unset".
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid([u8; 16]);

impl Uuid {
    pub const NIL: Uuid = Uuid([0; 16]);

    pub fn new_v4(rng: &mut SeededRng) -> Self {
        let mut bytes = rng.next_128_bits();
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Self(bytes)
    }

    /// Parse the 8-4-4-4-12 hex form (dashes optional).
    pub fn parse(text: &str) -> Option<Self> {
        let hex: String = text.trim().chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First eight bytes as an integer, for seed derivation.
    pub fn low_u64(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(head)
    }
}

impl Serialize for Uuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uuid::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid UUID: {s:?}")))
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({self})")
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IdGenerator
// ---------------------------------------------------------------------------

/// Mints UUIDs from its own seeded generator.
#[derive(Clone, Debug)]
pub struct IdGenerator {
    rng: SeededRng,
}

impl IdGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SeededRng::new(seed),
        }
    }

    pub fn next_uuid(&mut self) -> Uuid {
        Uuid::new_v4(&mut self.rng)
    }
}

// ---------------------------------------------------------------------------
// Strongly-typed entity ID wrappers
// ---------------------------------------------------------------------------

/// Declare a UUID-backed id newtype. Exported so the segment model can mint
/// its own id types the same way.
#[macro_export]
macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        pub struct $name(pub $crate::ids::Uuid);

        impl $name {
            pub fn generate(ids: &mut $crate::ids::IdGenerator) -> Self {
                Self(ids.next_uuid())
            }

            pub fn parse(text: &str) -> Option<Self> {
                $crate::ids::Uuid::parse(text).map(Self)
            }

            pub fn uuid(&self) -> $crate::ids::Uuid {
                self.0
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

entity_id!(/// A project: the top-level owner of libraries and templates.
ProjectId);
entity_id!(LibraryId);
entity_id!(/// A deployable template that scopes content for a chain.
TemplateId);
entity_id!(TemplateBindingId);
entity_id!(ProgramId);
entity_id!(ProgramMemeId);
entity_id!(ProgramVoiceId);
entity_id!(ProgramVoiceTrackId);
entity_id!(ProgramSequenceId);
entity_id!(ProgramSequenceBindingId);
entity_id!(ProgramSequenceBindingMemeId);
entity_id!(ProgramSequenceChordId);
entity_id!(ProgramSequenceChordVoicingId);
entity_id!(ProgramSequencePatternId);
entity_id!(ProgramSequencePatternEventId);
entity_id!(InstrumentId);
entity_id!(InstrumentMemeId);
entity_id!(/// One audio sample belonging to an instrument.
InstrumentAudioId);
