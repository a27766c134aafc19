use anyhow::{anyhow, Result};
use clap::{App, Arg, ArgMatches};

use std::process;

use mzre::analysis::{Analyzer, Options};
use mzre::codemap::{CodeMap, MapFormat};
use mzre::executable::Executable;
use mzre::mz::MzImage;

const LOAD_SEGMENT: u16 = 0x1000;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("mzptr")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Searches the executable for locations that could hold offsets of known data objects; review the suggestions and turn magic offsets into variable references during reconstruction")
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
        .arg(Arg::with_name("exe").help("Executable file").index(1).required(true))
        .arg(Arg::with_name("map").help("Map file of the executable").index(2).required(true))
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

    let exe_path = matches.value_of("exe").unwrap();
    let map_path = matches.value_of("map").unwrap();

    let mut mz = MzImage::open(exe_path)?;
    mz.load(LOAD_SEGMENT);
    let exe = Executable::from_mz(&mz)?;
    let map = CodeMap::load(map_path, LOAD_SEGMENT, MapFormat::Map)?;
    if map.code_size() != mz.load_module_size() {
        return Err(anyhow!(
            "map size {:#x} does not match size of executable load module {:#x}",
            map.code_size(),
            mz.load_module_size()
        ));
    }

    let analyzer = Analyzer::new(Options::default());
    analyzer.find_data_refs(&exe, &map)?;
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
