//! A differential fuzzer for RISC-V CPU implementations.
//!
//! The crate synthesizes biased, deliberately mutated 32-bit instruction
//! words, streams them in batches to physical or emulated boards over TCP or
//! a serial link, and compares the telemetry the boards send back. A board
//! that disagrees with itself (the same batch run twice) or with another
//! board (the same batch on different silicon) points at nondeterminism,
//! errata or architectural deviations.
//!
//! ## Getting Started
//!
//! Build a [`config::FuzzConfig`], generate a corpus with
//! [`generator::generate`], and hand it to an
//! [`orchestrator::FuzzCoordinator`] together with the boards.
//!
//! ```no_run
//! use riscvuzz::config::FuzzConfig;
//! use riscvuzz::generator::generate;
//! use riscvuzz::orchestrator::FuzzCoordinator;
//! use slog::{Logger, o};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // 1. Load and validate the run configuration.
//!     let config = FuzzConfig::from_file("fuzz.cfg")?;
//!
//!     // 2. Generate the instruction corpus. An explicit SEED makes it reproducible.
//!     let corpus = generate(&config, 10_000)?;
//!
//!     // 3. Wait for two boards to connect and drive them through the corpus.
//!     let logger = Logger::root(slog::Discard, o!());
//!     let listener = TcpListener::bind("0.0.0.0:8080").await?;
//!     let coordinator = FuzzCoordinator::new(config, corpus, logger);
//!     let report = coordinator.serve(Some(listener), 2, &[], 115_200).await?;
//!
//!     for divergence in report.divergences() {
//!         println!("batch {} diverged", divergence.batch_index);
//!     }
//!     Ok(())
//! }
//! ```
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod generator;
pub mod mutator;
pub mod oracle;
pub mod orchestrator;
pub mod reference;
pub mod sampler;
pub mod transport;
pub mod util;

mod constants;

pub use constants::{DEFAULT_MAX_RESULT_LEN, DEFAULT_SERIAL_BAUD, NOP};
