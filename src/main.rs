mod asciicast;
mod config;
mod events;
mod loader;
mod notifier;
mod player;
mod pty;
mod recorder;
mod signals;
mod term;
mod worker;
mod writer;

use std::io::Write;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;

use crate::config::Config;
use crate::events::EventKind;
use crate::notifier::Notifier;
use crate::player::{OutputFormat, PlayOptions};
use crate::recorder::RecordOptions;

#[derive(Parser)]
#[command(name = "tty-cast", version, about = "Record and replay terminal sessions")]
struct Cli {
    /// Suppress informational output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a terminal session to a file (or - for stdout)
    Rec(RecArgs),
    /// Replay a recording on this terminal
    Play(PlayArgs),
    /// Dump a recording's output with no pacing
    Cat(CatArgs),
}

#[derive(Args)]
struct RecArgs {
    /// Target file, or - for stdout
    filename: String,

    /// Command to record, defaults to $SHELL
    #[arg(short, long)]
    command: Option<String>,

    /// Append to an existing recording
    #[arg(long)]
    append: bool,

    /// Overwrite the target file if it exists
    #[arg(long)]
    overwrite: bool,

    /// Save raw output only, without timing or metadata
    #[arg(long)]
    raw: bool,

    /// Record keystrokes as input events
    #[arg(long)]
    stdin: bool,

    /// Cap recorded terminal inactivity at the given number of seconds
    #[arg(short = 'i', long, value_name = "SECS")]
    idle_time_limit: Option<f64>,

    /// Width override for the recorded terminal
    #[arg(long)]
    cols: Option<u16>,

    /// Height override for the recorded terminal
    #[arg(long)]
    rows: Option<u16>,

    /// Recording title
    #[arg(short, long)]
    title: Option<String>,

    /// Comma-separated variable names to capture into the header
    #[arg(long, default_value = "SHELL,TERM", value_name = "VARS")]
    env: String,

    /// Answer yes to all prompts (implies --overwrite)
    #[arg(short = 'y', long)]
    yes: bool,

    /// Command to record, given as trailing arguments
    #[arg(trailing_var_arg = true)]
    command_args: Vec<String>,
}

#[derive(Args)]
struct PlayArgs {
    /// Recording to play: a path, -, or an http(s)/ipfs location
    filename: String,

    /// Playback speed multiplier
    #[arg(short, long, default_value_t = 1.0)]
    speed: f64,

    /// Cap terminal inactivity at the given number of seconds
    #[arg(short = 'i', long, value_name = "SECS")]
    idle_time_limit: Option<f64>,

    /// Replay in a loop until interrupted
    #[arg(short = 'l', long = "loop")]
    loop_: bool,

    /// Pause automatically on marker events
    #[arg(short = 'm', long)]
    pause_on_markers: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutFmtArg::Raw)]
    out_fmt: OutFmtArg,

    /// Which event stream the raw output carries
    #[arg(long, value_enum)]
    stream: Option<StreamArg>,
}

#[derive(Args)]
struct CatArgs {
    /// Recording to dump: a path, -, or an http(s)/ipfs location
    filename: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutFmtArg {
    Raw,
    Asciicast,
}

#[derive(Clone, Copy, ValueEnum)]
enum StreamArg {
    O,
    I,
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("{}", format!("tty-cast: {err:#}").as_str().red());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;

    match cli.command {
        Commands::Rec(args) => rec(args, &config, cli.quiet),
        Commands::Play(args) => play(args, &config),
        Commands::Cat(args) => cat(&args.filename),
    }
}

fn info(quiet: bool, text: &str) {
    if !quiet {
        eprintln!("{}", format!("tty-cast: {text}").as_str().green());
    }
}

fn warning(quiet: bool, text: &str) {
    if !quiet {
        eprintln!("{}", format!("tty-cast: {text}").as_str().yellow());
    }
}

fn rec(args: RecArgs, config: &Config, quiet: bool) -> Result<()> {
    let overwrite = args.overwrite || args.yes;

    if args.filename == "-" && atty::is(atty::Stream::Stdout) {
        warning(
            quiet,
            "recording to stdout, which is a tty; the recording will interleave with the session",
        );
    }

    if args.filename != "-" {
        let existing = std::fs::metadata(&args.filename)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);

        if existing {
            if overwrite {
                std::fs::remove_file(&args.filename)?;
            } else if !args.append {
                bail!(
                    "{} already exists, use --overwrite or --append",
                    args.filename
                );
            }
        }
    }

    let command = match args.command {
        Some(command) => Some(command),
        None if !args.command_args.is_empty() => Some(shell_words::join(&args.command_args)),
        None => None,
    };

    let opts = RecordOptions {
        path: args.filename.clone(),
        command,
        append: args.append,
        raw: args.raw,
        record_stdin: args.stdin,
        idle_time_limit: args.idle_time_limit,
        title: args.title,
        capture_env: args
            .env
            .split(',')
            .map(str::trim)
            .filter(|var| !var.is_empty())
            .map(str::to_string)
            .collect(),
        cols_override: args.cols,
        rows_override: args.rows,
        key_bindings: config.record_keys.clone(),
    };

    let notifier = Notifier::detect(config.notifications, config.notify_command.clone());

    if args.append {
        info(quiet, &format!("appending to {}", args.filename));
    } else {
        info(quiet, &format!("recording session to {}", args.filename));
    }
    info(quiet, "exit the recorded shell or press <ctrl-d> when done");

    recorder::record(&opts, notifier)?;

    info(quiet, &format!("recording finished, saved to {}", args.filename));
    Ok(())
}

fn play(args: PlayArgs, config: &Config) -> Result<()> {
    let opts = PlayOptions {
        idle_time_limit: args.idle_time_limit,
        speed: args.speed,
        out_fmt: match args.out_fmt {
            OutFmtArg::Raw => OutputFormat::Raw,
            OutFmtArg::Asciicast => OutputFormat::Asciicast,
        },
        stream: match args.stream {
            Some(StreamArg::I) => EventKind::Input,
            Some(StreamArg::O) | None => EventKind::Output,
        },
        pause_on_markers: args.pause_on_markers,
        key_bindings: config.play_keys.clone(),
    };

    loop {
        let source = loader::open_source(&args.filename)?;
        let recording = asciicast::open(source)?;
        let completed = player::play(recording, &opts)?;

        if !completed || !args.loop_ {
            return Ok(());
        }
    }
}

fn cat(filename: &str) -> Result<()> {
    let source = loader::open_source(filename)?;
    let recording = asciicast::open(source)?;

    let mut stdout = std::io::stdout();
    for event in recording.events {
        let event = event?;
        if event.kind == EventKind::Output {
            if let Err(err) = stdout.write_all(event.payload().as_bytes()) {
                if err.kind() == std::io::ErrorKind::BrokenPipe {
                    return Ok(());
                }
                return Err(err.into());
            }
        }
    }
    stdout.flush().ok();

    Ok(())
}
