use anyhow::{anyhow, Result};
use clap::{App, Arg, ArgMatches};

use std::path::Path;
use std::process;

use mzre::codemap::{CodeMap, MapFormat};
use mzre::executable::Executable;
use mzre::mz::MzImage;
use mzre::signature::SignatureLibrary;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("mzsig")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Extracts routines of an executable at the locations given by its map file and saves their signatures, for duplicate lookup with mzdup")
        .arg(
            Arg::with_name("overwrite")
                .help("Overwrite the output file if it exists")
                .long("overwrite"),
        )
        .arg(
            Arg::with_name("minsize")
                .help("Skip routines shorter than this many instructions")
                .long("minsize")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("maxsize")
                .help("Skip routines longer than this many instructions")
                .long("maxsize")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Show information about extracted routines")
                .long("verbose"),
        )
        .arg(
            Arg::with_name("debug")
                .help("Show debug information")
                .long("debug"),
        )
        .arg(Arg::with_name("exe").help("Executable file").index(1).required(true))
        .arg(Arg::with_name("map").help("Map file of the executable").index(2).required(true))
        .arg(Arg::with_name("output").help("Output signature file").index(3).required(true))
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
    let out_path = matches.value_of("output").unwrap();
    if !matches.is_present("overwrite") && Path::new(out_path).exists() {
        return Err(anyhow!("output file already exists: {}", out_path));
    }
    let min_instructions = match matches.value_of("minsize") {
        Some(v) => v.parse()?,
        None => 1,
    };
    let max_instructions = match matches.value_of("maxsize") {
        Some(v) => v.parse()?,
        None => 0,
    };

    let load_segment = 0;
    let map = CodeMap::load(map_path, load_segment, MapFormat::Map)?;
    println!(
        "Loaded map file {}: {} segments, {} routines, {} variables",
        map_path,
        map.segments().len(),
        map.routine_count(),
        map.variable_count()
    );
    let mut mz = MzImage::open(exe_path)?;
    mz.load(load_segment);
    let exe = Executable::from_mz(&mz)?;
    let lib = SignatureLibrary::from_map(&map, &exe, min_instructions, max_instructions);
    println!("Extracted signatures from {} routines, saving to {}", lib.len(), out_path);
    lib.save(out_path)?;
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
