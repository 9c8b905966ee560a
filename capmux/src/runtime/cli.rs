use std::path::PathBuf;

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};

fn is_zero(v: &u8) -> bool {
    *v == 0
}

#[derive(Parser, Debug, Serialize, Deserialize)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity; repeat for more (-v packets and stats, -vv readiness, -vvv everything).
    #[arg(short, long, action = ArgAction::Count)]
    #[serde(skip_serializing_if = "is_zero", default)]
    pub verbose: u8,

    /// Capture filter expression (e.g. "tcp port 80").
    #[arg(short, long, value_name = "EXPR", env = "CAPMUX_FILTER")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Capture device to read from [default: eth0].
    #[arg(short, long, value_name = "DEVICE", env = "CAPMUX_INTERFACE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// Snapshot length in bytes [default: 65535].
    #[arg(short, long, value_name = "BYTES", env = "CAPMUX_SNAPLEN")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snaplen: Option<u32>,

    /// Set the path to the configuration file (e.g., "capmux.yaml").
    #[arg(short, long, value_name = "FILE", env = "CAPMUX_CONFIG_PATH")]
    #[serde(skip)]
    pub config: Option<PathBuf>,
}
