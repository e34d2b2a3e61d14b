// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::{io::Write, fs::File, path::Path, time::{Instant, Duration}};
use clap::{Command, Arg, ArgAction, ArgGroup, ArgMatches, crate_description, crate_version, value_parser};
use clap_num::{maybe_hex, si_number};
use anyhow::bail;

use ospi_nor::{Config, NorFlash, MX25R6435F};
use ospi_nor::config::{ReadMode, ProgramMode, Timing};
use ospi_nor::geometry::Geometry;
use ospi_nor::sim::{SimChip, SimLink};

const SELFTEST_DATA: &[u8] = b"NOR flash self-test pattern 0123456789";

/// Timeout override arguments, all in milliseconds.
const TIMEOUTS: &[(&str, &str)] = &[
    ("command-timeout", "Command phase and register write timeout in milliseconds"),
    ("transfer-timeout", "Interrupt-driven transfer completion timeout in milliseconds"),
    ("program-timeout", "Page program timeout in milliseconds"),
    ("sector-erase-timeout", "Sector erase timeout in milliseconds"),
    ("block-erase-timeout", "Block erase timeout in milliseconds"),
    ("chip-erase-timeout", "Chip erase timeout in milliseconds (k suffix allowed)"),
];

fn cli() -> Command {
    let mut cmd = Command::new("ospi-nor")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .infer_subcommands(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet")
             .global(true))
        .arg(Arg::new("image")
             .help("Flash image file backing the simulated chip, created blank if absent")
             .long("image")
             .short('i')
             .action(ArgAction::Set)
             .default_value("flash.bin")
             .global(true))
        .arg(Arg::new("read-mode")
             .help("Line width for array reads")
             .long("read-mode")
             .action(ArgAction::Set)
             .default_value("quad")
             .value_parser(["single", "dual", "quad"])
             .global(true))
        .arg(Arg::new("program-mode")
             .help("Line width for page programs")
             .long("program-mode")
             .action(ArgAction::Set)
             .default_value("quad")
             .value_parser(["single", "quad"])
             .global(true))
        .arg(Arg::new("poll-interval")
             .help("Delay between status register polls in microseconds (k and M suffixes allowed)")
             .long("poll-interval")
             .action(ArgAction::Set)
             .value_parser(si_number::<u64>)
             .global(true))
        .subcommand(Command::new("info")
            .about("Print flash geometry"))
        .subcommand(Command::new("status")
            .about("Read chip status and security registers"))
        .subcommand(Command::new("erase")
            .about("Erase a block, a sector, or the entire chip")
            .arg(Arg::new("block")
                 .help("Index of 64kB block to erase")
                 .long("block")
                 .action(ArgAction::Set)
                 .value_parser(value_parser!(usize)))
            .arg(Arg::new("sector")
                 .help("Index of 4kB sector to erase")
                 .long("sector")
                 .action(ArgAction::Set)
                 .value_parser(value_parser!(usize)))
            .arg(Arg::new("chip")
                 .help("Erase the entire chip")
                 .long("chip")
                 .action(ArgAction::SetTrue))
            .group(ArgGroup::new("target")
                 .args(["block", "sector", "chip"])
                 .required(true)))
        .subcommand(Command::new("write")
            .about("Write binary file to flash, which must already be erased")
            .arg(Arg::new("file")
                 .help("File to write to flash")
                 .required(true))
            .arg(Arg::new("offset")
                 .help("Start address (in bytes) to write to (decimal, or hex with 0x prefix)")
                 .long("offset")
                 .value_parser(maybe_hex::<u32>)
                 .default_value("0"))
            .arg(Arg::new("verify")
                 .help("Disable readback verification")
                 .short('n')
                 .long("no-verify")
                 .action(ArgAction::SetFalse)))
        .subcommand(Command::new("read")
            .about("Read flash contents to file")
            .arg(Arg::new("file")
                 .help("File to write flash contents to")
                 .required(true))
            .arg(Arg::new("offset")
                 .help("Start address (in bytes) of read (decimal, or hex with 0x prefix)")
                 .long("offset")
                 .action(ArgAction::Set)
                 .value_parser(maybe_hex::<u32>)
                 .default_value("0"))
            .arg(Arg::new("length")
                 .help("Length (in bytes) of read, defaults to the rest of the flash \
                       (decimal, or hex with 0x prefix)")
                 .long("length")
                 .action(ArgAction::Set)
                 .value_parser(maybe_hex::<usize>)))
        .subcommand(Command::new("selftest")
            .about("Erase sector 0, check it is blank, write a test pattern and read it back"));
    for (name, help) in TIMEOUTS {
        cmd = cmd.arg(Arg::new(*name)
                      .help(*help)
                      .long(*name)
                      .action(ArgAction::Set)
                      .value_parser(si_number::<u64>)
                      .global(true));
    }
    cmd
}

/// Apply any timing overrides given on the command line.
fn apply_timing(matches: &ArgMatches, timing: &mut Timing) {
    if let Some(&us) = matches.get_one::<u64>("poll-interval") {
        timing.poll_interval = Duration::from_micros(us);
    }
    let ms = |name: &str| matches.get_one::<u64>(name).map(|&v| Duration::from_millis(v));
    if let Some(t) = ms("command-timeout") { timing.command = t };
    if let Some(t) = ms("transfer-timeout") { timing.transfer = t };
    if let Some(t) = ms("program-timeout") { timing.page_program = t };
    if let Some(t) = ms("sector-erase-timeout") { timing.sector_erase = t };
    if let Some(t) = ms("block-erase-timeout") { timing.block_erase = t };
    if let Some(t) = ms("chip-erase-timeout") { timing.chip_erase = t };
    log::debug!("Timing: {:?}", timing);
}

#[allow(clippy::cognitive_complexity)]
fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    let mut config = Config::mx25r6435f();
    config.read_mode = match matches.get_one::<String>("read-mode").map(String::as_str) {
        Some("single") => ReadMode::Single,
        Some("dual") => ReadMode::Dual,
        _ => ReadMode::Quad,
    };
    config.program_mode = match matches.get_one::<String>("program-mode").map(String::as_str) {
        Some("single") => ProgramMode::Single,
        _ => ProgramMode::Quad,
    };
    apply_timing(&matches, &mut config.timing);

    // Info only needs the configured geometry.
    if matches.subcommand_name() == Some("info") {
        let info = NorFlash::new(SimLink::new(SimChip::new(config.geometry)), config)?.get_info();
        println!("MX25R6435F\n{}", info);
        return Ok(());
    }

    let image = matches.get_one::<String>("image").unwrap();
    let chip = load_chip(Path::new(image), MX25R6435F)?;
    let mut flash = NorFlash::new(SimLink::new(chip), config)?;

    // Status is read without initialising, so it reflects the image as loaded.
    if matches.subcommand_name() == Some("status") {
        let flags = flash.read_flags()?;
        println!("Status: {}", flash.get_status()?);
        println!("{:#?}", flags);
        return Ok(());
    }

    flash.init()?;
    let capacity = flash.get_info().capacity;

    match matches.subcommand_name() {
        Some("erase") => {
            let matches = matches.subcommand_matches("erase").unwrap();
            if let Some(&block) = matches.get_one::<usize>("block") {
                if !quiet { println!("Erasing block {}...", block) };
                flash.erase_block(block)?;
            } else if let Some(&sector) = matches.get_one::<usize>("sector") {
                if !quiet { println!("Erasing sector {}...", sector) };
                flash.erase_sector(sector)?;
            } else if quiet {
                flash.erase_chip()?;
            } else {
                flash.erase_chip_progress()?;
            }
        },
        Some("write") => {
            let matches = matches.subcommand_matches("write").unwrap();
            let path = matches.get_one::<String>("file").unwrap();
            let offset = *matches.get_one::<u32>("offset").unwrap();
            let verify = matches.get_flag("verify");
            let data = std::fs::read(path)?;
            if quiet {
                flash.write(offset, &data)?;
            } else {
                flash.write_progress(offset, &data)?;
            }
            if verify {
                let mut readback = vec![0u8; data.len()];
                flash.read(offset, &mut readback)?;
                if readback != data {
                    log::error!("Readback verification failed. Was the region erased first?");
                    bail!("Readback verification failed.");
                }
            }
        },
        Some("read") => {
            let matches = matches.subcommand_matches("read").unwrap();
            let path = matches.get_one::<String>("file").unwrap();
            let offset = *matches.get_one::<u32>("offset").unwrap();
            let length = if let Some(&length) = matches.get_one::<usize>("length") {
                length
            } else {
                log::info!("No length specified, reading to end of flash");
                capacity.saturating_sub(offset as usize)
            };
            let data = if quiet {
                let mut data = vec![0u8; length];
                flash.read(offset, &mut data)?;
                data
            } else {
                flash.read_progress(offset, length)?
            };
            let mut file = File::create(path)?;
            file.write_all(&data)?;
        },
        Some("selftest") => {
            if !quiet { println!("Erasing sector 0...") };
            flash.erase_sector(0)?;
            let mut buf = vec![0u8; SELFTEST_DATA.len()];
            flash.read(0, &mut buf)?;
            if buf.iter().any(|b| *b != 0xFF) {
                bail!("Sector 0 not blank after erase.");
            }
            if !quiet { println!("Writing test pattern...") };
            flash.write(0, SELFTEST_DATA)?;
            flash.read(0, &mut buf)?;
            if buf != SELFTEST_DATA {
                bail!("Test pattern readback mismatch.");
            }
            println!("Self-test passed: {}", String::from_utf8_lossy(&buf));
        },
        _ => panic!("Unhandled command."),
    }

    let chip = flash.release().into_chip();
    std::fs::write(image, chip.image())?;

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }

    Ok(())
}

fn load_chip(path: &Path, geometry: Geometry) -> anyhow::Result<SimChip> {
    if path.exists() {
        log::info!("Loading flash image from {}", path.display());
        SimChip::from_image(geometry, &std::fs::read(path)?)
    } else {
        log::info!("No image at {}, starting with blank flash", path.display());
        Ok(SimChip::new(geometry))
    }
}

#[test]
fn test_cli_is_valid() {
    cli().debug_assert();
}

#[test]
fn test_timing_overrides() {
    let matches = cli().try_get_matches_from([
        "ospi-nor", "--transfer-timeout", "50", "--chip-erase-timeout", "300k",
        "--poll-interval", "20", "erase", "--chip",
    ]).unwrap();
    let mut timing = Config::mx25r6435f().timing;
    let defaults = timing;
    apply_timing(&matches, &mut timing);
    assert_eq!(timing.transfer, Duration::from_millis(50));
    assert_eq!(timing.chip_erase, Duration::from_secs(300));
    assert_eq!(timing.poll_interval, Duration::from_micros(20));
    assert_eq!(timing.block_erase, defaults.block_erase);
    assert_eq!(timing.command, defaults.command);
}
