// Segment-side enums, declared through the shared `string_enum!` table so
// they parse and serialize exactly like the content enums.

use ostinato_content::string_enum;

string_enum!(/// Whether a chain is a production run or a preview.
ChainType { Production, Preview } fallback Production);

string_enum!(ChainState { Draft, Ready, Fabricate, Failed } fallback Draft);

string_enum!(/// How a segment relates to the one before it.
///
/// `Pending` until macro/main craft resolves it; `Initial` for the first
/// segment of a chain; `Continue` when the main program carries on;
/// `NextMain` when a new main program starts under the same macro program;
/// `NextMacro` when the macro program changes too.
SegmentType { Pending, Initial, Continue, NextMain, NextMacro } fallback Pending);

string_enum!(/// Lifecycle of a segment. `Failed` is terminal.
SegmentState { Planned, Crafting, Crafted, Failed } fallback Planned);

string_enum!(SegmentMessageType { Debug, Info, Warning, Error } fallback Info);
