//! Purpose: `tickmerge` CLI entry point.
//! Role: Binary crate root; parses args, runs the fan-in merge, emits a JSON summary on stdout.
//! Invariants: Non-interactive errors and notices are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: SIGINT/SIGTERM only set the shared stop flag; readers stop at their next line.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use clap::{Parser, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tickmerge::api::{
    BarrierQueue, BucketKey, Durability, EpochMerger, Error, ErrorKind, FileReader, HourOfDay,
    LineSink, MinuteOfDay, ReaderConfig, ReaderOutcome, to_exit_code,
};
use tickmerge::notice::{Notice, notice_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

#[derive(Parser)]
#[command(
    name = "tickmerge",
    version,
    about = "Merge per-symbol time-series files in timestamp order",
    long_about = None,
    after_help = r#"EXAMPLES
  $ tickmerge data/ticks.AAPL data/ticks.MSFT --output merged.csv
  $ tickmerge data/ticks.* --bucket minute --chunk-size 8388608

Each input is read through its own memory-mapped window. Records are
grouped by time bucket (hour of day by default); a bucket is sorted and
written only after every input has moved past it.

The symbol of an input is its file name after the first '.'.
Set RUST_LOG (e.g. RUST_LOG=debug) to control diagnostics on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        required = true,
        value_hint = ValueHint::FilePath,
        help = "Timestamp-sorted input files, one symbol per file"
    )]
    inputs: Vec<PathBuf>,
    #[arg(
        long,
        short,
        default_value = "merged.csv",
        value_hint = ValueHint::FilePath,
        help = "Output file; created or truncated"
    )]
    output: PathBuf,
    #[arg(
        long,
        help = "Read window per input in bytes (default: per-thread memory minus 1 MiB)"
    )]
    chunk_size: Option<usize>,
    #[arg(
        long,
        default_value = "hour",
        value_enum,
        help = "Time bucket that forms one merge epoch: hour|minute"
    )]
    bucket: BucketMode,
    #[arg(
        long,
        default_value = "deferred",
        value_enum,
        help = "Output durability: flush every line, or once at the end"
    )]
    durability: DurabilityMode,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BucketMode {
    Hour,
    Minute,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DurabilityMode {
    Flush,
    Deferred,
}

impl From<DurabilityMode> for Durability {
    fn from(mode: DurabilityMode) -> Self {
        match mode {
            DurabilityMode::Flush => Durability::Flush,
            DurabilityMode::Deferred => Durability::Deferred,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone)]
enum AnsiColor {
    Red,
    Yellow,
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `tickmerge --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    merge_command(&cli)
        .map_err(add_lock_hint)
        .map_err(|err| (err, color_mode))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn merge_command(cli: &Cli) -> Result<RunOutcome, Error> {
    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop)).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to install signal handler")
                .with_source(err)
        })?;
    }

    let mut config = ReaderConfig::default();
    if let Some(chunk_size) = cli.chunk_size {
        if chunk_size == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("--chunk-size must be positive")
                .with_hint("Pass a window size in bytes, e.g. --chunk-size 8388608."));
        }
        config = config.with_chunk_size(chunk_size);
    }

    match cli.bucket {
        BucketMode::Hour => merge_inputs(cli, HourOfDay, &config, stop),
        BucketMode::Minute => merge_inputs(cli, MinuteOfDay, &config, stop),
    }
}

struct SpawnedReader {
    path: PathBuf,
    symbol: String,
    handle: JoinHandle<Result<ReaderOutcome, Error>>,
}

fn merge_inputs<K>(
    cli: &Cli,
    key: K,
    config: &ReaderConfig,
    stop: Arc<AtomicBool>,
) -> Result<RunOutcome, Error>
where
    K: BucketKey + Clone + 'static,
{
    let mut readers = Vec::new();
    let mut files = Vec::new();
    for (id, path) in cli.inputs.iter().enumerate() {
        match FileReader::open(id, path, key.clone(), config) {
            Ok(reader) => readers.push(reader),
            Err(err) => {
                skipped_input_notice(path, &err, cli.color);
                files.push(failed_file_json(path, &err));
            }
        }
    }
    if readers.is_empty() {
        return Err(Error::new(ErrorKind::OpenFailed)
            .with_message("no input file could be opened")
            .with_hint("Check the input paths; see the notices above for each file."));
    }
    let opened = readers.len();

    let mut sink = LineSink::create(&cli.output, cli.durability.into())?;
    let queue = Arc::new(BarrierQueue::new(opened));
    let consumer = queue.consumer().ok_or_else(|| {
        Error::new(ErrorKind::Internal).with_message("queue consumer already taken")
    })?;

    let mut spawned = Vec::with_capacity(opened);
    let mut spawn_error = None;
    for reader in readers {
        let path = reader.path().to_path_buf();
        let symbol = reader.symbol().to_string();
        match reader.spawn(Arc::clone(&queue), Arc::clone(&stop)) {
            Ok(handle) => spawned.push(SpawnedReader {
                path,
                symbol,
                handle,
            }),
            Err(err) => {
                spawn_error = Some(err);
                break;
            }
        }
    }
    if let Some(err) = spawn_error {
        queue.abort();
        drop(consumer);
        join_readers(spawned, cli.color, &mut files);
        return Err(err);
    }

    let merged = EpochMerger::new(consumer).run(&mut sink);
    let reader_failures = join_readers(spawned, cli.color, &mut files);
    let summary = merged?;
    let lines = sink.finish()?;

    let stopped = stop.load(Ordering::Relaxed);
    if stopped {
        info!(records = summary.records, "merge stopped on request");
        emit_notice(&stop_notice(&cli.output, opened, summary.records), cli.color);
    }
    let failed = cli.inputs.len() - opened + reader_failures;
    let value = json!({
        "inputs": cli.inputs.len(),
        "readers": opened,
        "failed": failed,
        "epochs": summary.epochs,
        "records": summary.records,
        "lines": lines,
        "output": cli.output.display().to_string(),
        "stopped": stopped,
        "files": files,
    });
    emit_json(&value)?;
    Ok(RunOutcome::ok())
}

/// Joins every reader thread, recording one entry per file. Returns how many failed.
fn join_readers(spawned: Vec<SpawnedReader>, color_mode: ColorMode, files: &mut Vec<Value>) -> usize {
    let mut failures = 0;
    for reader in spawned {
        let result = reader.handle.join().unwrap_or_else(|_| {
            Err(Error::new(ErrorKind::Internal)
                .with_message("reader thread panicked")
                .with_path(&reader.path))
        });
        match result {
            Ok(outcome) => files.push(reader_file_json(&reader.path, &reader.symbol, &outcome)),
            Err(err) => {
                failures += 1;
                warn!(path = %reader.path.display(), error = %err, "reader ended with error");
                skipped_input_notice(&reader.path, &err, color_mode);
                files.push(failed_file_json(&reader.path, &err));
            }
        }
    }
    failures
}

fn reader_file_json(path: &Path, symbol: &str, outcome: &ReaderOutcome) -> Value {
    let mut entry = Map::new();
    entry.insert("path".to_string(), json!(path.display().to_string()));
    entry.insert("symbol".to_string(), json!(symbol));
    if let Ok(Value::Object(counters)) = serde_json::to_value(outcome) {
        entry.extend(counters);
    }
    Value::Object(entry)
}

fn failed_file_json(path: &Path, err: &Error) -> Value {
    json!({
        "path": path.display().to_string(),
        "error": format!("{:?}", err.kind()),
    })
}

fn emit_json(value: &Value) -> Result<(), Error> {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode summary")
            .with_source(err)
    })?;
    println!("{json}");
    Ok(())
}

fn skipped_input_notice(path: &Path, err: &Error, color_mode: ColorMode) {
    let mut notice = Notice::now(
        "skip",
        "merge",
        path.display().to_string(),
        format!("Skipped input: {}.", error_message(err)),
    )
    .with_detail("error_kind", format!("{:?}", err.kind()));
    if let Some(hint) = err.hint() {
        notice = notice.with_detail("hint", hint);
    }
    emit_notice(&notice, color_mode);
}

fn stop_notice(output: &Path, readers: usize, records: u64) -> Notice {
    Notice::now(
        "stop",
        "merge",
        output.display().to_string(),
        "Stop requested; output holds only the records merged before readers stopped.",
    )
    .with_detail("readers", readers)
    .with_detail("records", records)
}

fn paint(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

/// Writes one JSON diagnostic line to stderr under `key`.
fn emit_stderr_json(key: &str, value: Value) {
    let line = serde_json::to_string(&json!({ key: value })).unwrap_or_else(|_| {
        format!("{{\"{key}\":{{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}}}")
    });
    eprintln!("{line}");
}

fn emit_notice(notice: &Notice, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        let label = paint("notice:", color_mode.use_color(is_tty), AnsiColor::Yellow);
        eprintln!("{label} {} (file: {})", notice.message, notice.file);
        return;
    }
    let mut value = notice_json(notice);
    emit_stderr_json("notice", value["notice"].take());
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let report = ErrorReport::from_error(err);
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", report.render(color_mode.use_color(is_tty)));
        return;
    }
    emit_stderr_json("error", report.to_value());
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    let fallback = match err.kind() {
        ErrorKind::OpenFailed => "failed to open file",
        ErrorKind::StatFailed => "failed to read file size",
        ErrorKind::MapFailed => "failed to map file",
        ErrorKind::InvalidOffset => "offset beyond end of file",
        ErrorKind::InvalidPosition => "position outside mapped window",
        ErrorKind::NotMapped => "file is not mapped",
        ErrorKind::EndOfFile => "end of file",
        ErrorKind::WriteError => "write failed",
        ErrorKind::Usage => "usage error",
        ErrorKind::Io => "i/o error",
        ErrorKind::Internal => "internal error",
    };
    fallback.to_string()
}

/// Flattened view of an `Error` shared by the JSON and terminal renderings.
#[derive(Debug, Serialize)]
struct ErrorReport {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    causes: Vec<String>,
}

impl ErrorReport {
    fn from_error(err: &Error) -> Self {
        let causes = std::iter::successors(err.source(), |&source| source.source())
            .map(ToString::to_string)
            .collect();
        Self {
            kind: format!("{:?}", err.kind()),
            message: error_message(err),
            hint: err.hint().map(str::to_string),
            path: err.path().map(|path| path.display().to_string()),
            offset: err.offset(),
            causes,
        }
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "kind": self.kind }))
    }

    /// Terminal form: the message, then one labelled line per known field.
    /// Only the outermost cause is shown.
    fn render(&self, use_color: bool) -> String {
        let offset = self.offset.map(|offset| offset.to_string());
        let details = [
            ("hint:", self.hint.as_deref()),
            ("path:", self.path.as_deref()),
            ("offset:", offset.as_deref()),
            ("caused by:", self.causes.first().map(String::as_str)),
        ];
        let mut out = format!("{} {}", paint("error:", use_color, AnsiColor::Red), self.message);
        for (label, value) in details {
            if let Some(value) = value {
                out.push('\n');
                out.push_str(&paint(label, use_color, AnsiColor::Yellow));
                out.push(' ');
                out.push_str(value);
            }
        }
        out
    }
}

fn add_lock_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::OpenFailed || err.hint().is_some() {
        return err;
    }
    let Some(path) = err.path().map(Path::to_path_buf) else {
        return err;
    };
    if path.exists() {
        err.with_hint("Check that the file is readable and not held by another tickmerge run.")
    } else {
        err.with_hint("Check that the output directory exists.")
    }
}

/// First non-blank line of clap's rendering, without its `error:` prefix.
fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.strip_prefix("error:").unwrap_or(line).trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}
