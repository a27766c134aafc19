use anyhow::{anyhow, Result};
use clap::{App, Arg};

use std::process;

use mzre::mz::MzImage;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("mzhdr")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Prints the MZ header of a DOS executable, or extracts its load module")
        .arg(
            Arg::with_name("offset")
                .help("Only print the offset of the load module")
                .short("l"),
        )
        .arg(
            Arg::with_name("size")
                .help("Only print the size of the load module")
                .short("s"),
        )
        .arg(
            Arg::with_name("patch")
                .help("Patch relocations to the given hex segment and dump the load module to a file")
                .short("p")
                .takes_value(true)
                .number_of_values(2)
                .value_names(&["seg", "outfile"]),
        )
        .arg(
            Arg::with_name("output-format")
                .help("The output format for the header dump")
                .short("F")
                .long("format")
                .takes_value(true)
                .possible_values(&["text", "json"])
                .default_value("text"),
        )
        .arg(Arg::with_name("mzfile").help("Executable to inspect").index(1).required(true))
}

fn run() -> Result<()> {
    let matches = app().get_matches();
    let mz_path = matches.value_of("mzfile").unwrap();
    let mut mz = MzImage::open(mz_path)?;

    if matches.is_present("offset") {
        println!("{:#x}", mz.header_length());
    } else if matches.is_present("size") {
        println!("{:#x}", mz.load_module_size());
    } else if let Some(mut values) = matches.values_of("patch") {
        let seg_str = values.next().unwrap();
        let out_file = values.next().unwrap();
        let load_segment = u16::from_str_radix(seg_str.trim_start_matches("0x"), 16)
            .map_err(|_| anyhow!("invalid segment value: {}", seg_str))?;
        mz.load(load_segment);
        mz.write_load_module(out_file)?;
    } else {
        match matches.value_of("output-format").unwrap() {
            "json" => println!("{}", serde_json::to_string_pretty(&mz.info())?),
            "text" => println!("{}", mz.describe()),
            _ => unreachable!(),
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            1
        }
    });
}
