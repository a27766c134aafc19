use anyhow::{anyhow, Result};
use clap::{App, Arg, ArgMatches};

use std::process;

use mzre::analysis::{Analyzer, Options};
use mzre::codemap::{CodeMap, MapFormat};
use mzre::executable::Executable;
use mzre::mz::MzImage;
use mzre::signature::SignatureLibrary;

const LOAD_SEGMENT: u16 = 0x1000;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("mzdup")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Identifies routines in the target executable duplicating signatures from the input file; the updated map is saved with a .dup suffix")
        .arg(
            Arg::with_name("minsize")
                .help("Skip routines smaller than this many instructions")
                .long("minsize")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("maxdist")
                .help("Maximum difference between routines reported as duplicates, percent of size")
                .long("maxdist")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Show more detailed information about processed routines")
                .long("verbose"),
        )
        .arg(
            Arg::with_name("debug")
                .help("Show debug information")
                .long("debug"),
        )
        .arg(Arg::with_name("sigfile").help("Signature file").index(1).required(true))
        .arg(Arg::with_name("exe").help("Target executable").index(2).required(true))
        .arg(Arg::with_name("map").help("Target executable map file").index(3).required(true))
}

fn init_logging(matches: &ArgMatches) {
    let default = if matches.is_present("debug") {
        "trace"
    } else if matches.is_present("verbose") {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn run() -> Result<()> {
    let matches = app().get_matches();
    init_logging(&matches);

    let sig_path = matches.value_of("sigfile").unwrap();
    let exe_path = matches.value_of("exe").unwrap();
    let map_path = matches.value_of("map").unwrap();
    let options = Options::from(&matches);

    let sigs = SignatureLibrary::load(sig_path)?;
    let mut mz = MzImage::open(exe_path)?;
    mz.load(LOAD_SEGMENT);
    let exe = Executable::from_mz(&mz)?;
    let mut map = CodeMap::load(map_path, LOAD_SEGMENT, MapFormat::Map)?;
    if map.code_size() != mz.load_module_size() {
        return Err(anyhow!(
            "map size {:#x} does not match size of executable load module {:#x}",
            map.code_size(),
            mz.load_module_size()
        ));
    }

    let analyzer = Analyzer::new(options);
    if analyzer.find_duplicates(&sigs, &exe, &mut map)? {
        let out = format!("{}.dup", map_path);
        map.save(&out, LOAD_SEGMENT, true)?;
        println!("Duplicates found, updated map saved to {}", out);
    } else {
        println!("No duplicates found");
    }
    Ok(())
}

fn main() {
    process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            1
        }
    });
}
