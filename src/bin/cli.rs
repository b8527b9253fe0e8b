//! mpsync command line interface.

use std::{
    path::{Path, PathBuf},
    process,
};

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    ArgMatches, SubCommand,
};
use console::style;
use log::{debug, trace, warn, LevelFilter};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use simplelog::*;

use mpsync::{
    self as mp, CancelToken, EntryKind, RemoteFs, Settings, SettingsBuilder, SyncReport,
    Verification,
};

/// Exit status when the push completed but the board could not be verified.
const VERIFICATION_FAILED: i32 = 2;
/// Exit status after `Ctrl+C`, as for a shell command killed by `SIGINT`.
const INTERRUPTED: i32 = 130;

fn main() {
    println!("[MP] mpsync v{}", crate_version!());

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            mpsync mirrors a local directory to the filesystem of a board \
            running MicroPython, over its serial console. The running program \
            is interrupted, the interpreter is switched to raw REPL mode and \
            each filesystem operation is sent as a small Python command.\n\
            \n\
            Only files whose content differs from the copy on the board are \
            written, so a second push of an unchanged tree does nothing. \
            After the push, the board is listed again to verify the result, \
            then soft reset so that the new `main.py` runs.\n\
            \n\
            Exit status: 0 on success, 1 on error, 2 when the board could not \
            be verified, 130 when cancelled with Ctrl+C.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .setting(SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("PORT")
                .help("the serial port of the board")
                .long_help(
                    "the serial port of the board; when not set, the \
                     detected serial ports are presented for selection. When \
                     set but not present yet, `mpsync` waits for it to show \
                     up.",
                )
                .short("-t")
                .long("--port")
                .takes_value(true)
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("serial port baud rate")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200")
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("DATA_BITS")
                .help("number of bits per character")
                .short("-d")
                .long("--data-bits")
                .takes_value(true)
                .possible_values(&["5", "6", "7", "8"])
                .default_value("8")
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("STOP_BITS")
                .help("number of stop bits per byte")
                .short("-s")
                .long("--stop-bits")
                .takes_value(true)
                .possible_values(&["1", "2"])
                .default_value("1")
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("PARITY")
                .help("parity checking protocol")
                .short("-p")
                .long("--parity")
                .takes_value(true)
                .possible_values(&["none", "odd", "even"])
                .default_value("none")
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("FLOW_CONTROL")
                .help("flow control mode")
                .short("-f")
                .long("--flow-control")
                .takes_value(true)
                .possible_values(&["none", "soft", "hard"])
                .default_value("none")
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("NO_RESET")
                .help("do not soft reset the board when done")
                .long("--no-reset")
                .global(true),
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help(
                    "Sets the logging level of verbosity, repeat several times \
                     for higher verbosity",
                ),
        )
        .subcommand(
            SubCommand::with_name("push")
                .about("push local files and directories to the board")
                .arg(
                    Arg::with_name("ROOT")
                        .help("local directory mirrored to the remote root")
                        .long("--root")
                        .takes_value(true)
                        .default_value(".")
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("REMOTE_ROOT")
                        .help("directory on the board receiving the files")
                        .long("--remote-root")
                        .takes_value(true)
                        .default_value("/")
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("PRUNE")
                        .help("remove remote entries that do not exist locally")
                        .long("--prune"),
                )
                .arg(
                    Arg::with_name("DRY_RUN")
                        .help("print the plan without changing the board")
                        .long("--dry-run"),
                )
                .arg(
                    Arg::with_name("NO_VERIFY")
                        .help("skip listing the board again after the push")
                        .long("--no-verify"),
                )
                .arg(
                    Arg::with_name("RETRIES")
                        .help("extra attempts for a step failing on a transient error")
                        .long("--retries")
                        .takes_value(true)
                        .default_value("2")
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("CHUNK_SIZE")
                        .help("payload bytes per write command")
                        .long("--chunk-size")
                        .takes_value(true)
                        .default_value("256")
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("PATHS")
                        .help("files or directories to push, relative to the root")
                        .long_help(
                            "files or directories to push, relative to the \
                             root; when not set, everything under the root is \
                             pushed.",
                        )
                        .multiple(true)
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("ls")
                .about("list the files on the board")
                .arg(
                    Arg::with_name("PATH")
                        .help("remote directory to list")
                        .default_value("/")
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("rm")
                .about("remove a file from the board")
                .arg(
                    Arg::with_name("DIR")
                        .help("remove an empty directory instead of a file")
                        .long("--dir"),
                )
                .arg(
                    Arg::with_name("PATH")
                        .help("remote path to remove")
                        .required(true)
                        .index(1),
                ),
        )
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'mpsync -v -v -v' or 'mpsync -vvv' vs 'mpsync -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(err) = TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("cannot install the logger: {}", err);
    }

    trace!("{:#?}", matches);

    let cancel = CancelToken::default();
    let handler_cancel = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        if handler_cancel.is_cancelled() {
            process::exit(INTERRUPTED);
        }
        println!("🛑 received Ctrl+C, stopping after the current step");
        handler_cancel.cancel();
    }) {
        warn!("Cannot install the Ctrl+C handler: {}", err);
    }

    let builder = base_settings(&matches).path(resolve_port(&matches));

    let exit_code = match matches.subcommand() {
        ("push", Some(args)) => push(builder, args, cancel),
        ("ls", Some(args)) => list(builder.finalize(), args.value_of("PATH").unwrap_or("/")),
        ("rm", Some(args)) => {
            let kind = if args.is_present("DIR") {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            remove(builder.finalize(), args.value_of("PATH").unwrap_or_default(), kind)
        }
        _ => unreachable!("clap requires a subcommand"),
    };
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

// Arguments with default values ===============================================

/// Serial parameters and options shared by every subcommand.
fn base_settings(matches: &ArgMatches) -> SettingsBuilder {
    // Arguments with default values always have one: either what the user
    // typed or the default.
    let baud_rate: u32 = numeric(matches, "BAUD_RATE", "baud-rate");

    let data_bits = match matches.value_of("DATA_BITS") {
        Some("5") => DataBits::Five,
        Some("6") => DataBits::Six,
        Some("7") => DataBits::Seven,
        _ => DataBits::Eight,
    };

    let stop_bits = match matches.value_of("STOP_BITS") {
        Some("2") => StopBits::Two,
        _ => StopBits::One,
    };

    let parity = match matches.value_of("PARITY") {
        Some("even") => Parity::Even,
        Some("odd") => Parity::Odd,
        _ => Parity::None,
    };

    let flow_control = match matches.value_of("FLOW_CONTROL") {
        Some("soft") => FlowControl::Software,
        Some("hard") => FlowControl::Hardware,
        _ => FlowControl::None,
    };

    SettingsBuilder::default()
        .baud_rate(baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(flow_control)
        .soft_reset_on_exit(!matches.is_present("NO_RESET"))
}

fn numeric<T: std::str::FromStr>(matches: &ArgMatches, name: &str, flag: &str) -> T {
    value_t!(matches.value_of(name), T).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a numeric value",
            style("error").red(),
            style(flag).cyan()
        );
        println!(
            "   {} `{}` is not a valid value",
            style("-->").cyan(),
            style(matches.value_of(name).unwrap_or_default()).on_red()
        );
        process::exit(1);
    })
}

/// The port given on the command line once it exists, or one picked by the
/// user among the detected ones.
fn resolve_port(matches: &ArgMatches) -> String {
    if let Some(path) = matches.value_of("PORT") {
        if !Path::new(path).exists() && mp::wait_for_port(path) {
            process::exit(INTERRUPTED);
        }
        return path.to_owned();
    }
    loop {
        if let Some(path) = mp::select_port() {
            return path;
        }
    }
}

// Subcommands =================================================================

fn push(builder: SettingsBuilder, args: &ArgMatches, cancel: CancelToken) -> i32 {
    let root = PathBuf::from(args.value_of("ROOT").unwrap_or("."));
    let paths: Vec<PathBuf> = args
        .values_of("PATHS")
        .map(|values| values.map(PathBuf::from).collect())
        .unwrap_or_default();

    let settings = builder
        .remote_root(args.value_of("REMOTE_ROOT").unwrap_or("/"))
        .step_retries(numeric(args, "RETRIES", "retries"))
        .chunk_size(numeric(args, "CHUNK_SIZE", "chunk-size"))
        .prune(args.is_present("PRUNE"))
        .dry_run(args.is_present("DRY_RUN"))
        .verify(!args.is_present("NO_VERIFY"))
        .finalize();

    let local = match mp::scan(&root, &paths) {
        Ok(local) => local,
        Err(err) => return fail(&err),
    };
    if local.is_empty() {
        println!("[MP] nothing to push under {}", root.display());
        return 0;
    }

    match mp::session::factory(settings, local, cancel).run() {
        Ok(report) => print_report(&report),
        Err(mp::Error::Cancelled) => {
            println!("[MP] {}", style("cancelled").yellow());
            INTERRUPTED
        }
        Err(err) => fail(&err),
    }
}

fn print_report(report: &SyncReport) -> i32 {
    if report.dry_run {
        println!(
            "[MP] {} step(s) planned, {} file(s) unchanged",
            report.planned.len(),
            report.unchanged
        );
        for step in &report.planned {
            println!("     {}", step);
        }
        return 0;
    }

    println!(
        "[MP] {} {} step(s), {} bytes written, {} file(s) unchanged",
        style("✔").green(),
        report.executed,
        report.bytes_written,
        report.unchanged
    );
    match &report.verification {
        Verification::Skipped => 0,
        Verification::Passed => {
            println!("[MP] {} board content verified", style("✔").green());
            0
        }
        Verification::Mismatched(mismatches) => {
            for mismatch in mismatches {
                println!("[MP] {} {}", style("✘").red(), mismatch);
            }
            VERIFICATION_FAILED
        }
        Verification::Unavailable(reason) => {
            println!("[MP] {} cannot verify: {}", style("?").yellow(), reason);
            VERIFICATION_FAILED
        }
    }
}

fn list(settings: Settings, path: &str) -> i32 {
    let mut fs = match RemoteFs::connect(&settings) {
        Ok(fs) => fs,
        Err(err) => return fail(&err),
    };
    let listed = fs.list(path);
    if let Err(err) = fs.close() {
        warn!("Could not leave raw mode cleanly: {}", err);
    }

    match listed {
        Ok(entries) => {
            for entry in entries {
                match entry.kind {
                    EntryKind::Directory => {
                        println!("{:>8}  {:16}  {}", "", "", style(&entry.path).blue())
                    }
                    EntryKind::File => println!(
                        "{:>8}  {:16}  {}",
                        entry.size.unwrap_or_default(),
                        entry.digest.as_deref().map_or("-", |d| &d[..d.len().min(16)]),
                        entry.path
                    ),
                }
            }
            0
        }
        Err(err) => fail(&err),
    }
}

fn remove(settings: Settings, path: &str, kind: EntryKind) -> i32 {
    let mut fs = match RemoteFs::connect(&settings) {
        Ok(fs) => fs,
        Err(err) => return fail(&err),
    };
    let removed = fs.remove(path, kind);
    if let Err(err) = fs.close() {
        warn!("Could not leave raw mode cleanly: {}", err);
    }

    match removed {
        Ok(()) => {
            println!("[MP] removed {} {}", kind, path);
            0
        }
        Err(err) => fail(&err),
    }
}

fn fail(err: &mp::Error) -> i32 {
    println!("{}: {}", style("error").red(), err);
    1
}
