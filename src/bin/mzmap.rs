use anyhow::{anyhow, Context, Result};
use clap::{App, Arg, ArgMatches};

use std::path::Path;
use std::process;

use mzre::addr::Address;
use mzre::analysis::{Analyzer, Options};
use mzre::codemap::{CodeMap, MapFormat};
use mzre::executable::Executable;
use mzre::memory::parse_pattern;
use mzre::mz::MzImage;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("mzmap")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Scans a DOS MZ executable for routines and variables, emitting an editable map file; without an exe argument, prints a summary of an existing map")
        .arg(
            Arg::with_name("load")
                .help("Load segment override, hex (default 1000)")
                .long("load")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("linkmap")
                .help("Seed routine locations from a Microsoft LINK map file")
                .long("linkmap")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("overwrite")
                .help("Overwrite the output map file if it already exists")
                .long("overwrite"),
        )
        .arg(
            Arg::with_name("brief")
                .help("Only show uncompleted and unclaimed areas in the map summary")
                .long("brief"),
        )
        .arg(
            Arg::with_name("format")
                .help("Print routines in a form directly writable back to the map file")
                .long("format"),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Show more detailed information")
                .long("verbose"),
        )
        .arg(
            Arg::with_name("debug")
                .help("Show debug information")
                .long("debug"),
        )
        .arg(
            Arg::with_name("file1")
                .help("Executable to scan (file.exe[:entrypoint]), or a map/listing file to print")
                .index(1)
                .required(true),
        )
        .arg(
            Arg::with_name("file2")
                .help("Output map file")
                .index(2),
        )
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

// Loads an executable from a `path[:entrypoint]` spec; the entrypoint can
// be a hex offset, a seg:off pair, or a [hex??bytes] pattern searched in
// the image.
fn load_exe(spec: &str, load_segment: u16) -> Result<Executable> {
    let (path, entry) = match spec.find(':') {
        Some(pos) => (&spec[..pos], Some(&spec[pos + 1..])),
        None => (spec, None),
    };
    let mut mz = MzImage::open(path).with_context(|| format!("unable to open {}", path))?;
    mz.load(load_segment);
    let mut exe = Executable::from_mz(&mz)?;
    if let Some(entry) = entry {
        if let Some(hexa) = entry.strip_prefix('[').and_then(|e| e.strip_suffix(']')) {
            let pattern = parse_pattern(hexa)?;
            let ep = exe
                .find(&pattern, None)
                .ok_or_else(|| anyhow!("could not find pattern '{}' in {}", hexa, path))?;
            exe.set_entrypoint(ep, false)?;
        } else {
            let ep = Address::parse(entry, false)?;
            exe.set_entrypoint(ep, true)?;
        }
    }
    Ok(exe)
}

fn load_and_print_map(mapfile: &str, verbose: bool, brief: bool, format: bool) -> Result<()> {
    let lower = mapfile.to_lowercase();
    let map_format = if lower.ends_with(".lst") { MapFormat::IdaListing } else { MapFormat::Map };
    let map = CodeMap::load(mapfile, 0, map_format)?;
    let sum = map.summary(verbose, brief, format)?;
    print!("{}", sum.text);
    // converting a listing also saves it in the native format
    if map.is_ida() {
        map.save(format!("{}.map", mapfile), 0, true)?;
    }
    Ok(())
}

fn run() -> Result<()> {
    let matches = app().get_matches();
    init_logging(&matches);

    let load_segment = match matches.value_of("load") {
        Some(s) => u16::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|_| anyhow!("invalid load segment: {}", s))?,
        None => 0x1000,
    };
    let file1 = matches.value_of("file1").unwrap();

    // a single file means printing an existing map
    let file2 = match matches.value_of("file2") {
        Some(f) => f,
        None => {
            return load_and_print_map(
                file1,
                matches.is_present("verbose"),
                matches.is_present("brief"),
                matches.is_present("format"),
            )
        }
    };

    if !matches.is_present("overwrite") && Path::new(file2).exists() {
        return Err(anyhow!("output file already exists: {}", file2));
    }
    let mut exe = load_exe(file1, load_segment)?;
    let mut analyzer = Analyzer::new(Options::default());
    if let Some(linkmap) = matches.value_of("linkmap") {
        let linkmap = CodeMap::load(linkmap, load_segment, MapFormat::MsLink)?;
        analyzer.seed_queue(&linkmap, &mut exe);
    }
    let map = analyzer.explore_code(&mut exe)?;
    if map.is_empty() {
        return Err(anyhow!("unable to find any routines"));
    }
    if matches.is_present("verbose") {
        let sum = map.summary(true, matches.is_present("brief"), false)?;
        print!("{}", sum.text);
    }
    map.save(file2, load_segment, matches.is_present("overwrite"))?;
    println!(
        "Please review the output file ({}) and assign names to the routines and segments;\n\
         block ranges may need manual corrections, this tool is not perfect",
        file2
    );
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
