//! # Command-Line Interface
//!
//! User-facing CLI commands and output formatting.
//!
//! ## Commands
//!
//! | Group | Purpose | Examples |
//! |-------|---------|----------|
//! | Project | Setup | `init`, `init --sample` |
//! | Inspect | Declarations and ordering | `stacks`, `graph`, `plan <stack>` |
//! | Apply | Reconcile stacks | `apply <stack>`, `apply --all` |
//! | State | Published results | `outputs <stack>`, `status`, `history` |
//!
//! ## Output Formats
//!
//! All commands support the `--format` flag:
//! - `text` (default) - Human-readable output
//! - `json` - Machine-parseable JSON
//!
//! ## Logging
//!
//! Diagnostics go to stderr through `tracing`. Use `--verbose` (or `-v`)
//! for debug logs, or set `STACKCTL_LOG` to any filter directive:
//! ```bash
//! STACKCTL_LOG=stackctl=info stackctl apply --all
//! ```
//!
//! ## Entry Point
//!
//! Call [`run()`] to parse arguments and execute the appropriate command.

mod app;
mod apply;
mod logging;
mod output;
mod query;

pub use app::{run, Cli, Commands};
pub use output::{Output, OutputFormat};
