//! Generates RISC-V instruction corpora and runs differential campaigns
//! against boards connected over TCP or serial.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use slog::{Drain, Level, Logger, info, o, warn};
use tokio::net::TcpListener;

use riscvuzz::DEFAULT_SERIAL_BAUD;
use riscvuzz::catalog::Catalog;
use riscvuzz::config::FuzzConfig;
use riscvuzz::generator::{Corpus, GeneratorSession};
use riscvuzz::orchestrator::FuzzCoordinator;
use riscvuzz::reference::{Mismatch, SubprocessEncoder, cross_validate};

#[derive(Parser, Debug)]
#[command(name = "board_diff", version)]
struct Args {
    /// Run configuration in KEY=value form. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the SEED config key
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a corpus and write it out without contacting any board
    Generate {
        /// Number of base instructions (mutation may add more)
        #[arg(long, default_value_t = 1000)]
        count: usize,

        #[arg(long, value_enum, default_value_t = OutputFormat::Hex)]
        format: OutputFormat,

        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Drive boards through a corpus and report divergences
    Serve(ServeArgs),
    /// Compare the instruction encoder with an external reference assembler
    CheckEncoder {
        /// Reference encoder executable
        #[arg(long)]
        reference: String,

        /// Extra argument for the reference encoder; may be repeated
        #[arg(long = "reference-arg")]
        reference_args: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Number of base instructions to generate
    #[arg(long, default_value_t = 1000)]
    count: usize,

    /// Replay a raw little-endian corpus instead of generating one
    #[arg(long)]
    corpus: Option<PathBuf>,

    /// Address to accept TCP boards on, e.g. 0.0.0.0:8080
    #[arg(long)]
    listen: Option<String>,

    /// Number of TCP boards to wait for
    #[arg(long, default_value_t = 1)]
    boards: usize,

    /// Serial device of a board; may be repeated
    #[arg(long)]
    serial: Vec<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_SERIAL_BAUD)]
    baud: u32,

    /// Write the JSON report to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Hex,
    C,
    Bin,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::Error,
            LogLevel::Warn => Level::Warning,
            LogLevel::Info => Level::Info,
            LogLevel::Debug => Level::Debug,
            LogLevel::Trace => Level::Trace,
        }
    }
}

fn build_logger(level: Level) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain.filter_level(level).fuse(), o!())
}

fn load_config(args: &Args) -> Result<FuzzConfig> {
    let mut config = match &args.config {
        Some(path) => FuzzConfig::from_file(path)
            .with_context(|| format!("invalid config file {}", path.display()))?,
        None => FuzzConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    config.validate()?;
    Ok(config)
}

fn write_corpus(corpus: &Corpus, format: OutputFormat, output: Option<&PathBuf>) -> Result<()> {
    let bytes = match format {
        OutputFormat::Hex => corpus.to_hex().into_bytes(),
        OutputFormat::C => corpus.to_c_array().into_bytes(),
        OutputFormat::Bin => corpus.to_le_bytes(),
    };
    match output {
        Some(path) => std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display())),
        None => {
            use std::io::Write;
            if matches!(format, OutputFormat::Bin) {
                bail!("refusing to write a binary corpus to stdout, pass --output");
            }
            std::io::stdout().write_all(&bytes).context("failed to write corpus")
        }
    }
}

async fn serve(config: FuzzConfig, args: ServeArgs, logger: &Logger) -> Result<bool> {
    if args.listen.is_none() && args.serial.is_empty() {
        bail!("nothing to fuzz: pass --listen and/or --serial");
    }
    let corpus = match &args.corpus {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            Corpus::from_le_bytes(&bytes).ok_or_else(|| anyhow!("{} is not a whole number of words", path.display()))?
        }
        None => {
            let mut session = GeneratorSession::new(&config)?;
            info!(logger, "generating corpus"; "seed" => session.seed(), "base" => args.count);
            session.generate(args.count)
        }
    };
    let listener = match args.listen {
        Some(addr) => Some(
            TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to listen on {addr}"))?,
        ),
        None => None,
    };
    let expected = if listener.is_some() { args.boards } else { 0 };

    info!(logger, "corpus ready"; "words" => corpus.len(), "batch_size" => config.batch_size);
    let coordinator = FuzzCoordinator::new(config, corpus, logger.clone());
    let report = coordinator.serve(listener, expected, &args.serial, args.baud).await?;

    for board in &report.boards {
        info!(logger, "board finished";
            "board" => &board.board, "endpoint" => &board.endpoint,
            "batches" => board.batches_completed, "end" => format!("{:?}", board.end));
    }
    let divergences = report.divergences().count();
    if divergences > 0 {
        warn!(logger, "divergences found"; "count" => divergences);
    } else {
        info!(logger, "no divergence found"; "comparisons" => report.comparisons.len());
    }
    if let Some(path) = args.report {
        let json = report.to_json().context("failed to serialize report")?;
        std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(divergences > 0)
}

fn check_encoder(config: &FuzzConfig, reference: &str, args: &[String], logger: &Logger) -> Result<bool> {
    let catalog = Catalog::build(config)?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut encoder = SubprocessEncoder::spawn(reference, &args)
        .with_context(|| format!("failed to start reference encoder {reference}"))?;
    let mismatches = cross_validate(&catalog, &mut encoder, config.xlen);
    for mismatch in &mismatches {
        match mismatch {
            Mismatch::Fields {
                mnemonic,
                ours,
                reference,
            } => warn!(logger, "encoding mismatch";
                "mnemonic" => *mnemonic,
                "ours" => format!("{ours:#010x}"),
                "reference" => format!("{reference:#010x}")),
            Mismatch::Unencodable { mnemonic, error } => {
                warn!(logger, "reference could not encode"; "mnemonic" => *mnemonic, "error" => %error)
            }
        }
    }
    info!(logger, "encoder check finished";
        "templates" => catalog.len(), "mismatches" => mismatches.len());
    Ok(!mismatches.is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let logger = build_logger(args.log_level.into());
    let config = load_config(&args)?;

    let failed = match args.command {
        Command::Generate { count, format, output } => {
            let mut session = GeneratorSession::new(&config)?;
            let corpus = session.generate(count);
            info!(logger, "corpus generated";
                "seed" => session.seed(), "base" => count, "words" => corpus.len());
            write_corpus(&corpus, format, output.as_ref())?;
            false
        }
        Command::Serve(serve_args) => serve(config, serve_args, &logger).await?,
        Command::CheckEncoder {
            reference,
            reference_args,
        } => check_encoder(&config, &reference, &reference_args, &logger)?,
    };

    // Flush the async drain before choosing the exit code.
    drop(logger);
    if failed {
        std::process::exit(2);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_line_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn serve_options_land_in_serve_args() {
        let args = Args::try_parse_from([
            "board_diff",
            "--seed",
            "7",
            "serve",
            "--listen",
            "127.0.0.1:8080",
            "--boards",
            "2",
            "--serial",
            "/dev/ttyUSB0",
            "--serial",
            "/dev/ttyUSB1",
        ])
        .unwrap();
        assert_eq!(args.seed, Some(7));
        let Command::Serve(serve) = args.command else {
            panic!("expected the serve subcommand");
        };
        assert_eq!(serve.listen.as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(serve.boards, 2);
        assert_eq!(serve.serial.len(), 2);
        assert_eq!(serve.baud, DEFAULT_SERIAL_BAUD);
        assert_eq!(serve.count, 1000);
    }
}
