#![forbid(unsafe_code)]
//! The command line shared by every clustune operation binary:
//!
//! `<tool> [-i|--interactive] [-v|--verbose]... [-q|--quiet]... [-h|--help] [-V|--version] <device> [<argument>]`

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use ctn_core::{
    Operation, Runtime, RuntimeConfig, init_tracing, install_termination_handler, run_operation,
};
use std::ffi::OsString;
use std::path::Path;
use std::process::ExitCode;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct Args {
    #[arg(short, long)]
    interactive: bool,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[arg(short, long, action = ArgAction::Count)]
    quiet: u8,

    #[arg(short, long)]
    help: bool,

    #[arg(short = 'V', long)]
    version: bool,

    device: Option<String>,

    argument: Option<String>,
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Help,
    Version,
    /// Print usage and fail.
    Usage,
    Run {
        device: String,
        argument: Option<String>,
        verbosity: i32,
        interactive: bool,
    },
}

/// Parse `args` (including the program name). Never exits.
pub fn parse_invocation<I, T>(args: I) -> Invocation
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let Ok(args) = Args::try_parse_from(args) else {
        return Invocation::Usage;
    };
    if args.help {
        return Invocation::Help;
    }
    if args.version {
        return Invocation::Version;
    }
    let Some(device) = args.device else {
        return Invocation::Usage;
    };
    Invocation::Run {
        device,
        argument: args.argument,
        verbosity: 1 + i32::from(args.verbose) - i32::from(args.quiet),
        interactive: args.interactive,
    }
}

#[must_use]
pub fn usage(progname: &str, op_args: &str) -> String {
    format!(
        "Usage: {progname} [opts] <device> {op_args}\n\
         [opts] can be any mix of:\n\
         \t-i|--interactive\n\
         \t-v|--verbose (more than one increases verbosity)\n\
         \t-q|--quiet (more than one decreases verbosity)\n\
         \t-h|--help\n\
         \t-V|--version"
    )
}

/// Program name from `argv[0]`, or `clustune-<operation>` if there is none.
#[must_use]
pub fn progname(argv0: Option<&OsString>, op: &dyn Operation) -> String {
    argv0
        .and_then(|arg| Path::new(arg).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("clustune-{}", op.name()))
}

/// Run `op` as a whole process: parse `args`, open the device, run, and
/// report. The exit code is zero only when the operation succeeded.
pub fn operation_main(op: &mut dyn Operation, args: impl IntoIterator<Item = OsString>) -> ExitCode {
    let args: Vec<OsString> = args.into_iter().collect();
    let progname = progname(args.first(), op);

    let (device, argument, verbosity, interactive) = match parse_invocation(args) {
        Invocation::Help => {
            println!("{}", usage(&progname, op.usage_args()));
            return ExitCode::SUCCESS;
        }
        Invocation::Version => {
            println!("{progname} {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Invocation::Usage => {
            eprintln!("{}", usage(&progname, op.usage_args()));
            return ExitCode::FAILURE;
        }
        Invocation::Run {
            device,
            argument,
            verbosity,
            interactive,
        } => (device, argument, verbosity, interactive),
    };

    init_tracing(verbosity);
    let config = RuntimeConfig::from_env(&progname)
        .with_verbosity(verbosity)
        .with_interactive(interactive);
    let mut runtime = Runtime::host(&config);

    if let Err(err) = op.parse_arg(argument.as_deref()) {
        runtime.console().error(&err);
        eprintln!("{}", usage(&progname, op.usage_args()));
        return ExitCode::FAILURE;
    }

    match run(&mut runtime, op, &device) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            runtime.console().error(format_args!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(runtime: &mut Runtime, op: &mut dyn Operation, device: &str) -> Result<()> {
    install_termination_handler(runtime.cx())?;
    debug!(op = op.name(), device, handoff = ?runtime.handoff(), "starting");
    run_operation(runtime, op, device)
        .with_context(|| format!("{} on device \"{device}\"", op.name()))
}
