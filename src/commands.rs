//! CLI command definitions
//!
//! Defines the clap commands for the bridge CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Launch a script under the inspector (replaces the active session)
    Start {
        /// Script to run
        script: PathBuf,

        /// Stay paused on the first statement
        #[arg(long)]
        break_on_start: bool,

        /// Wait until the debugger is attached before returning
        #[arg(long)]
        wait: bool,
    },

    /// Stop a session (terminates its runtime)
    Stop,

    /// List known sessions
    #[command(alias = "ls")]
    List,

    /// Show a session's status, breakpoints, pause location and console tail
    Show {
        /// Number of console lines to include
        #[arg(long, default_value = "20")]
        tail: usize,
    },

    /// Set a breakpoint
    #[command(name = "break", alias = "b")]
    Break {
        /// Location: LINE (in the session's script) or FILE:LINE
        location: String,
    },

    /// Remove a breakpoint by id
    #[command(alias = "d")]
    Delete {
        /// Breakpoint id as printed by 'break'
        id: String,
    },

    /// Step over (execute current line, step over function calls)
    #[command(alias = "n")]
    Next,

    /// Step into (execute current line, step into function calls)
    #[command(alias = "s")]
    Step,

    /// Step out (run until current function returns)
    #[command(alias = "out")]
    Finish,

    /// Continue execution
    #[command(alias = "c")]
    Continue,

    /// Pause a running script
    Pause,

    /// Evaluate an expression (in the paused frame if paused)
    #[command(alias = "p")]
    Eval {
        /// Expression to evaluate
        expression: String,
    },

    /// Show variables of a scope in the paused frame
    Vars {
        /// Scope type: local, closure, global, ...
        #[arg(default_value = "local")]
        scope: String,
    },

    /// Show captured console output
    Console {
        /// Get last N messages
        #[arg(long, default_value = "20")]
        tail: usize,
    },

    /// Stream every state change as JSON lines until interrupted
    Watch,

    /// Get daemon/session status
    Status,

    /// Stop every session and shut the daemon down
    Shutdown,

    /// View daemon logs (for debugging)
    Logs {
        /// Number of lines to show (default: 50)
        #[arg(long, short = 'n', default_value = "50")]
        lines: usize,

        /// Follow log output (like tail -f)
        #[arg(long, short)]
        follow: bool,

        /// Clear the log file
        #[arg(long)]
        clear: bool,
    },

    /// [Hidden] Run in daemon mode - spawned automatically
    #[command(hide = true)]
    Daemon,
}
