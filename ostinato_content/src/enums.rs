// String-backed enums for the content model.
//
// Every enum that appears in content files goes through the `string_enum!`
// table: one variant list yields `ALL`, `as_str`, `Display`, a
// case-insensitive `parse` that falls back to a documented default instead
// of failing, and serde impls that write the variant name and read it back
// through the same fallback. Content authored by hand or by older tools
// therefore never fails to load over an unrecognised enum string.
//
// The macro is exported; the segment model in `ostinato_fabric` declares
// its own enums with it.

/// Declare a string-backed enum with a fallback variant.
///
/// ```ignore
/// string_enum!(/// Docs.
///     Color { Red, Green } fallback Red);
/// ```
#[macro_export]
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident),+ $(,)? } fallback $fallback:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Variant used when parsing unrecognised text.
            pub const FALLBACK: $name = $name::$fallback;

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }

            /// Case-insensitive parse; `None` for unrecognised text.
            pub fn try_parse(text: &str) -> Option<Self> {
                let text = text.trim();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(text))
            }

            /// Case-insensitive parse, falling back to `FALLBACK`.
            pub fn parse(text: &str) -> Self {
                Self::try_parse(text).unwrap_or(Self::FALLBACK)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::FALLBACK
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let text = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                Ok(Self::parse(&text))
            }
        }
    };
}

string_enum!(/// Role a program plays in a segment.
ProgramType { Macro, Main, Beat, Detail } fallback Main);

string_enum!(ProgramState { Draft, Published } fallback Draft);

string_enum!(/// Musical role of an instrument (and of a program voice).
InstrumentType {
    Background,
    Bass,
    Drum,
    Hook,
    Pad,
    Percussion,
    Stab,
    Sticky,
    Stripe,
    Transition,
} fallback Drum);

string_enum!(/// How an instrument's audios are triggered: by pattern events, by
/// chord changes, or as continuous loops.
InstrumentMode { Event, Chord, Loop } fallback Event);

string_enum!(InstrumentState { Draft, Published } fallback Draft);

string_enum!(/// What a template binding points at.
ContentBindingType { Library, Program, Instrument } fallback Library);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(InstrumentType::parse("pad"), InstrumentType::Pad);
        assert_eq!(InstrumentType::parse(" STRIPE "), InstrumentType::Stripe);
        assert_eq!(ProgramType::parse("macro"), ProgramType::Macro);
    }

    #[test]
    fn unknown_text_falls_back() {
        assert_eq!(ProgramType::parse("Symphony"), ProgramType::Main);
        assert_eq!(InstrumentType::parse(""), InstrumentType::Drum);
        assert_eq!(InstrumentMode::parse("Sampler"), InstrumentMode::Event);
        assert_eq!(ContentBindingType::parse("?"), ContentBindingType::Library);
        assert_eq!(InstrumentMode::try_parse("Sampler"), None);
    }

    #[test]
    fn all_round_trips_through_as_str() {
        for t in InstrumentType::ALL {
            assert_eq!(InstrumentType::parse(t.as_str()), *t);
        }
        assert_eq!(InstrumentType::ALL.len(), 10);
    }

    #[test]
    fn serde_writes_names_and_reads_with_fallback() {
        assert_eq!(serde_json::to_string(&InstrumentMode::Loop).unwrap(), "\"Loop\"");
        let parsed: InstrumentMode = serde_json::from_str("\"chord\"").unwrap();
        assert_eq!(parsed, InstrumentMode::Chord);
        let parsed: ProgramState = serde_json::from_str("\"Archived\"").unwrap();
        assert_eq!(parsed, ProgramState::Draft);
    }
}
