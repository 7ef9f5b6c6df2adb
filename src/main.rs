use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vpx_replay::codec::{self, CodecAdapter, DecoderFactory};
use vpx_replay::config::{Cli, ReplayConfig};
use vpx_replay::pipeline::{Pipeline, SelectionState};
use vpx_replay::publish::{FramePublisher, LogPreview, ShmAllocator};
use vpx_replay::recording::Player;
use vpx_replay::replay::{ReplaySummary, Replayer};
use vpx_replay::session::Od4Session;

#[cfg(feature = "ffmpeg")]
fn decoder_factory() -> Box<dyn DecoderFactory> {
    Box::new(vpx_replay::codec::ffmpeg::FfmpegDecoderFactory::new())
}

#[cfg(not(feature = "ffmpeg"))]
fn decoder_factory() -> Box<dyn DecoderFactory> {
    Box::new(vpx_replay::codec::UnavailableDecoderFactory)
}

async fn run(config: ReplayConfig) -> anyhow::Result<ReplaySummary> {
    let player = Player::open(&config.recording)
        .with_context(|| format!("failed to open '{}'", config.recording.display()))?;
    let session = Od4Session::open(config.cid)
        .with_context(|| format!("failed to join session {}", config.cid))?;

    let mut publisher = FramePublisher::new(&config.name, Box::new(ShmAllocator));
    if config.verbose {
        publisher = publisher.with_preview(Box::new(LogPreview::default()));
    }
    let pipeline = Pipeline::new(
        SelectionState::new(config.sender_filter),
        CodecAdapter::new(decoder_factory()),
        publisher,
    )
    .with_forward_policy(config.forward_policy);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping replay");
            interrupt.cancel();
        }
    });

    let summary = Replayer::new(player, session, pipeline, cancel)
        .run()
        .await
        .context("replay failed")?;
    Ok(summary)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not failures
            let code = if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
            let _ = e.print();
            return code;
        }
    };

    let config = match ReplayConfig::try_from(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vpx-replay: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .init();

    info!(
        cid = config.cid,
        region = %config.name,
        recording = %config.recording.display(),
        sender = ?config.sender_filter,
        "vpx-replay starting"
    );
    if !codec::has_decoder_backend() {
        warn!(
            "No decoder backend compiled in, the first video envelope will stop the replay. \
             Rebuild with `--features ffmpeg` to decode VP8/VP9"
        );
    }

    match run(config).await {
        Ok(summary) => {
            info!(
                published = summary.published_frames,
                forwarded = summary.forwarded,
                reason = ?summary.stop_reason,
                "Done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
