// CLI entry point: fabricate a short chain and print what each segment got.
//
// Loads content from a JSON file, or uses the built-in demo library when no
// file is given, opens a chain on one template and fabricates segments one
// after another. One summary line is printed per segment. This exercises
// the core; it is not a scheduler and never waits on a clock.
//
// Usage:
//   fabricate [CONTENT_JSON] [OPTIONS]
//     --template <ID>     Template name, ship key or id (default: first)
//     --segments <N>      Segments to fabricate (default: 8)
//     --seed <N>          Factory seed (default: 0)
//     --retain <N>        Segments kept in the store (default: 64)
//     --rewrite-at <US>   After fabricating, rewrite from this chain time
//     --override-macro <PROGRAM>  Macro program forced by the rewrite
//     --override-memes <A,B,..>   Memes forced by the rewrite
//
// Logging is controlled by RUST_LOG (default: info).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ostinato_content::ContentStore;
use ostinato_content::demo::demo_library;
use ostinato_content::enums::ProgramType;
use ostinato_content::ids::ProgramId;
use ostinato_fabric::segment::{SegmentChoice, SegmentChoiceArrangementPick, SegmentId};
use ostinato_fabric::work::DEFAULT_RETENTION;
use ostinato_fabric::{CraftWork, FabricatorFactory, Rewrite};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fabricate", about = "Fabricate segments of an ostinato chain")]
struct Args {
    /// Content JSON; the demo library when omitted.
    content: Option<PathBuf>,

    #[arg(long)]
    template: Option<String>,

    #[arg(long, default_value_t = 8)]
    segments: u32,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = DEFAULT_RETENTION)]
    retain: u32,

    /// Chain time in microseconds to rewrite from once fabrication is done.
    #[arg(long)]
    rewrite_at: Option<i64>,

    /// Macro program name or id forced by the rewrite.
    #[arg(long, requires = "rewrite_at")]
    override_macro: Option<String>,

    #[arg(long, value_delimiter = ',', requires = "rewrite_at")]
    override_memes: Vec<String>,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("fabricate: {message}");
            ExitCode::FAILURE
        }
    }
}

fn load_content(path: Option<&PathBuf>) -> Result<ContentStore, String> {
    let Some(path) = path else {
        return Ok(demo_library());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("reading {}: {e}", path.display()))?;
    ContentStore::from_json(&text).map_err(|e| format!("loading {}: {e}", path.display()))
}

fn find_macro_program(content: &ContentStore, identifier: &str) -> Result<ProgramId, String> {
    content
        .programs_of_type(ProgramType::Macro)
        .into_iter()
        .find(|p| p.name == identifier || p.id.uuid().to_string() == identifier)
        .map(|p| p.id)
        .ok_or_else(|| format!("no macro program {identifier}"))
}

fn print_segment(work: &CraftWork, id: SegmentId) -> Result<(), String> {
    let store = work.store();
    let Some(segment) = store.read_segment(id) else {
        return Err(format!("{id} vanished after fabrication"));
    };
    println!(
        "{:>4} {:<9} key={:<8} tempo={:<6.1} total={:<3} choices={:<3} picks={}",
        id.0,
        segment.type_.as_str(),
        segment.key,
        segment.tempo,
        segment.total,
        store.read_all::<SegmentChoice>(id).len(),
        store.read_all::<SegmentChoiceArrangementPick>(id).len(),
    );
    Ok(())
}

fn run(args: &Args) -> Result<(), String> {
    let content = load_content(args.content.as_ref())?;
    let factory = FabricatorFactory::new(args.seed);
    let mut work = CraftWork::start(&content, args.template.as_deref(), factory)
        .map_err(|e| e.to_string())?
        .with_retention(args.retain);

    for _ in 0..args.segments {
        let id = work.fabricate_next().map_err(|e| e.to_string())?;
        print_segment(&work, id)?;
    }

    let Some(at) = args.rewrite_at else {
        return Ok(());
    };
    let rewrite = Rewrite {
        macro_program: args
            .override_macro
            .as_deref()
            .map(|name| find_macro_program(work.content(), name))
            .transpose()?,
        memes: args.override_memes.iter().cloned().collect(),
    };
    match work.rewrite(at, &rewrite).map_err(|e| e.to_string())? {
        Some(id) => {
            println!("rewrote from {at}us:");
            print_segment(&work, id)
        }
        None => {
            println!("nothing to rewrite at {at}us");
            Ok(())
        }
    }
}
