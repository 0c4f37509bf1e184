// Commandline argument parser using clap for goertzel-link

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct LinkArgs {
    #[command(subcommand, long_about)]
    /// Which task to perform
    pub command: CommandTask,

    /// Settings file in RON format; stock node settings when omitted
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// List the serial devices that are present
    #[command(about)]
    Ports,

    /// Connect to a node and print every event as a line of JSON
    #[command(about)]
    Listen(ListenCommand),

    /// Take connect/disconnect commands as JSON lines on stdin and print
    /// events as JSON lines on stdout
    #[command(about)]
    Bridge(BridgeCommand),

    /// Compare the node's Goertzel results against a raw sample capture
    #[command(about)]
    Compare(CompareCommand),

    /// Energy or latency of streaming raw samples versus on-node Goertzel
    #[command(about)]
    Scenario(ScenarioCommand),

    /// Print the default settings file
    #[command(about)]
    DefaultConfig,
}

#[derive(Debug, Args, Clone)]
pub struct ListenCommand {
    /// Device path; a selector is shown when omitted
    #[arg(short, long)]
    pub port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value_t = 115200)]
    pub baud: u32,

    /// Use a simulated node instead of a serial device
    #[arg(long)]
    pub simulate: bool,
}

#[derive(Debug, Args, Clone)]
pub struct BridgeCommand {
    /// Use a simulated node instead of serial devices
    #[arg(long)]
    pub simulate: bool,
}

#[derive(Debug, Args, Clone)]
pub struct CompareCommand {
    /// Raw ADC samples, comma separated or one per line
    #[arg(short, long)]
    pub samples: PathBuf,

    /// The node's Goertzel table (CSV, TSV, JSON or a `listen` capture)
    #[arg(short, long)]
    pub table: PathBuf,

    /// Ignore frequencies above this, in Hz
    #[arg(short = 'l', long = "freq-limit", default_value_t = 1500.0)]
    pub freq_limit: f64,

    /// Only compare these frequencies
    #[arg(long = "select")]
    #[clap(num_args = 1..)]
    pub selected: Vec<f64>,

    /// Print the report as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ScenarioCommand {
    /// Compare latency instead of energy
    #[arg(long)]
    pub latency: bool,

    /// Frame sizes to evaluate; the measured sizes when omitted
    #[arg(long)]
    #[clap(num_args = 1..)]
    pub sizes: Vec<u32>,
}

/// Arguments of the `monitor` binary.
#[derive(Debug, Parser, Clone)]
#[clap(version, about = "Live chart of the power a sensor node reports")]
pub struct MonitorArgs {
    /// Device path; a selector is shown when omitted
    #[arg(short, long)]
    pub port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value_t = 115200)]
    pub baud: u32,

    /// Use a simulated node instead of a serial device
    #[arg(long)]
    pub simulate: bool,

    /// Settings file in RON format
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
}
