use anyhow::{anyhow, Context, Result};
use clap::{App, Arg, ArgMatches};

use std::process;

use mzre::addr::Address;
use mzre::analysis::{Analyzer, Options};
use mzre::codemap::{CodeMap, MapFormat};
use mzre::executable::Executable;
use mzre::memory::parse_pattern;
use mzre::mz::MzImage;

const LOAD_SEGMENT: u16 = 0x1000;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("mzdiff")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Compares two DOS MZ executables instruction by instruction, accounting for differences in code layout")
        .arg(
            Arg::with_name("map")
                .help("Map file of the reference executable (recommended, otherwise functionality is limited)")
                .long("map")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("loose")
                .help("Non-strict matching, allows e.g. literal argument differences")
                .long("loose"),
        )
        .arg(
            Arg::with_name("variant")
                .help("Treat equivalent instruction variants as matching")
                .long("variant"),
        )
        .arg(
            Arg::with_name("rskip")
                .help("Ignore up to this many consecutive mismatching instructions in the reference executable")
                .long("rskip")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tskip")
                .help("Ignore up to this many consecutive mismatching instructions in the target executable")
                .long("tskip")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ctx")
                .help("Number of context instructions shown after a mismatch")
                .long("ctx")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("nocall")
                .help("Do not follow calls, useful for comparing single routines")
                .long("nocall"),
        )
        .arg(
            Arg::with_name("asm")
                .help("Descend into routines marked as assembly, normally skipped")
                .long("asm"),
        )
        .arg(
            Arg::with_name("idiff")
                .help("Keep going after differences instead of failing")
                .long("idiff"),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Show more detailed information, including compared instructions")
                .long("verbose"),
        )
        .arg(
            Arg::with_name("debug")
                .help("Show debug information")
                .long("debug"),
        )
        .arg(
            Arg::with_name("base")
                .help("Reference executable (base.exe[:entrypoint])")
                .index(1)
                .required(true),
        )
        .arg(
            Arg::with_name("compare")
                .help("Executable to compare against the reference (compare.exe[:entrypoint])")
                .index(2)
                .required(true),
        )
}

fn init_logging(matches: &ArgMatches) {
    let default = if matches.is_present("debug") {
        "trace"
    } else if matches.is_present("verbose") {
        "debug"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

// Loads an executable from a `path[:entrypoint]` spec. The entrypoint part
// can be a hex offset, a `begin-end` range (the end becoming the stop
// address), or a bracketed hex pattern with ?? wildcards searched in the
// image.
fn load_exe(spec: &str, load_segment: u16, opt: &mut Options) -> Result<Executable> {
    let (path, entry) = match spec.find(':') {
        Some(pos) => (&spec[..pos], Some(&spec[pos + 1..])),
        None => (spec, None),
    };
    let mut mz = MzImage::open(path).with_context(|| format!("unable to open {}", path))?;
    mz.load(load_segment);
    let mut exe = Executable::from_mz(&mz)?;
    let entry = match entry {
        Some(e) => e,
        None => return Ok(exe),
    };
    if let Some(hexa) = entry.strip_prefix('[').and_then(|e| e.strip_suffix(']')) {
        let pattern = parse_pattern(hexa)?;
        let ep = exe
            .find(&pattern, None)
            .ok_or_else(|| anyhow!("could not find pattern '{}' in {}", hexa, path))?;
        exe.set_entrypoint(ep, false)?;
    } else {
        let (ep_str, stop_str) = match entry.find('-') {
            Some(pos) => (&entry[..pos], Some(&entry[pos + 1..])),
            None => (entry, None),
        };
        if !ep_str.is_empty() {
            let ep = Address::parse(ep_str, false)?;
            exe.set_entrypoint(ep, true)?;
        }
        if let Some(stop_str) = stop_str {
            if opt.stop_addr.is_none() {
                let mut stop = Address::parse(stop_str, false)?;
                stop.relocate(load_segment)?;
                if stop <= exe.entrypoint() {
                    return Err(anyhow!(
                        "stop address {} before executable entrypoint {}",
                        stop,
                        exe.entrypoint()
                    ));
                }
                opt.stop_addr = Some(stop);
            }
        }
    }
    Ok(exe)
}

fn run() -> Result<i32> {
    let matches = app().get_matches();
    init_logging(&matches);

    let mut opt = Options::from(&matches);
    let base = load_exe(matches.value_of("base").unwrap(), LOAD_SEGMENT, &mut opt)?;
    let compare = load_exe(matches.value_of("compare").unwrap(), LOAD_SEGMENT, &mut opt)?;
    let map = match matches.value_of("map") {
        Some(path) => CodeMap::load(path, LOAD_SEGMENT, MapFormat::Map)?,
        None => CodeMap::new(LOAD_SEGMENT, 0),
    };

    let mut analyzer = Analyzer::new(opt);
    let matched = analyzer.compare_code(&base, &compare, &map)?;
    println!("Comparison {}", if matched { "successful" } else { "failed" });
    Ok(if matched { 0 } else { 1 })
}

fn main() {
    process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            1
        }
    });
}
