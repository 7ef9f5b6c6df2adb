//! Command line configuration.

use clap::Parser;
use std::path::PathBuf;

use crate::pipeline::ForwardPolicy;
use crate::session::session_group;
use crate::{ReplayError, Result};

/// Replays envelopes from a .rec file while restoring contained VP8 or VP9
/// frames as packed 32-bit frames into a shared memory area.
#[derive(Parser, Clone, Debug)]
#[command(name = "vpx-replay", version, about)]
pub struct Cli {
    /// Session id of the live session that receives the other envelopes
    #[arg(long)]
    pub cid: u16,

    /// Name of the shared memory area to create
    #[arg(long)]
    pub name: String,

    /// Only decode video from this sender stamp; default: the sender of the
    /// first envelope
    #[arg(long)]
    pub id: Option<u32>,

    /// Print decoding information and preview statistics
    #[arg(long, default_value_t = false)]
    pub verbose: bool,

    /// Also forward non-video envelopes of senders other than the selected one
    #[arg(long, default_value_t = false)]
    pub forward_all_senders: bool,

    /// Recording to replay
    pub recording: PathBuf,
}

/// Validated replay settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayConfig {
    pub cid: u16,
    pub name: String,
    pub sender_filter: Option<u32>,
    pub verbose: bool,
    pub forward_policy: ForwardPolicy,
    pub recording: PathBuf,
}

impl TryFrom<Cli> for ReplayConfig {
    type Error = ReplayError;

    fn try_from(cli: Cli) -> Result<Self> {
        session_group(cli.cid)?;

        let name = cli.name.trim();
        if name.is_empty() || name.trim_start_matches('/').contains('/') {
            return Err(ReplayError::config(format!("invalid shared memory name '{}'", cli.name)));
        }

        Ok(Self {
            cid: cli.cid,
            name: name.to_string(),
            sender_filter: cli.id,
            verbose: cli.verbose,
            forward_policy: if cli.forward_all_senders {
                ForwardPolicy::AllSenders
            } else {
                ForwardPolicy::TargetOnly
            },
            recording: cli.recording,
        })
    }
}

impl ReplayConfig {
    /// Parse and validate an argument list (first item is the program name).
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| ReplayError::config(e.to_string()))?;
        Self::try_from(cli)
    }

    /// Default log filter for this configuration
    pub fn log_filter(&self) -> &'static str {
        if self.verbose { "debug" } else { "info" }
    }
}
