use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use reel_publisher::config::{self, Config};
use reel_publisher::content;
use reel_publisher::cover;
use reel_publisher::database::PublishHistory;
use reel_publisher::errors::AppError;
use reel_publisher::session::{
    FileByteStore, LoginContext, LoginStrategyChain, SessionStore, TerminalPrompt,
};
use reel_publisher::single_instance::{register_cancel_handler, InstanceLock};
use reel_publisher::uploader::retry::random_between;
use reel_publisher::uploader::{BridgeClient, ClipUpload, RetryPolicy, UploadOrchestrator};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("Starting Reel Publisher v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            let setup = e
                .downcast_ref::<AppError>()
                .is_some_and(AppError::is_setup_error);
            if setup {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let config = config::load_config()?;
    let credentials = config.credentials()?;
    let account = credentials.username.clone();

    let data_dir = config::get_data_directory()?;
    let _lock = InstanceLock::acquire(&data_dir.join("locks"), &account)?;

    let cancel = CancellationToken::new();
    register_cancel_handler(cancel.clone())?;

    let videos = content::find_videos(&config.content_dir)?;
    let Some(video) = content::pick_random(&videos) else {
        log::info!("No videos to publish in {}", config.content_dir.display());
        return Ok(ExitCode::SUCCESS);
    };
    if let Err(e) = content::validate_video_file(&video) {
        log::error!("Skipping {}: {}", video.display(), e);
        return Ok(ExitCode::FAILURE);
    }
    log::info!("Selected {} ({} candidates)", video.display(), videos.len());

    let history = open_history(&data_dir).await;
    let file_name = video
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let fingerprint = content::fingerprint(&video)?;
    if let Some(history) = &history {
        match history
            .was_published(&file_name, &fingerprint, &account)
            .await
        {
            Ok(true) => {
                log::warn!("{} was already published; removing leftover file", file_name);
                content::remove_published(&video);
                return Ok(ExitCode::SUCCESS);
            }
            Ok(false) => {}
            Err(e) => log::warn!("History lookup failed (non-critical): {}", e),
        }
    }

    let call_timeout = Duration::from_secs(config.call_timeout_seconds);
    let cover = if config.generate_cover {
        cover::extract_cover(&video, &data_dir.join("covers"), call_timeout).await
    } else {
        None
    };

    let bridge = Arc::new(
        BridgeClient::new(&config.bridge_url, call_timeout).context("creating bridge client")?,
    );
    let store = SessionStore::new(
        Arc::new(FileByteStore::new(config.session_directory()?)),
        &account,
    );
    let chain = LoginStrategyChain::standard(LoginContext {
        credentials,
        store,
        auth: bridge.clone(),
        prompt: Arc::new(TerminalPrompt),
        call_timeout,
    });
    let orchestrator = UploadOrchestrator::new(
        chain,
        bridge,
        RetryPolicy::from_config(&config),
        cancel.clone(),
    );

    let clip = ClipUpload {
        video: video.clone(),
        caption: config.caption.clone(),
        cover: cover.clone(),
    };

    let started_at = Utc::now();
    let outcome = orchestrator.publish(&clip, config.max_attempts).await;

    if let Some(history) = &history {
        if let Err(e) = history
            .record(&file_name, &fingerprint, &account, &outcome, started_at)
            .await {
            log::warn!("Failed to record publish history (non-critical): {}", e);
        }
    }

    if let Some(cover) = &cover {
        cover::remove_cover(cover).await;
    }

    if !outcome.succeeded {
        if outcome.cancelled {
            log::warn!("Publish cancelled after {} attempts", outcome.attempt_count());
        } else {
            log::error!(
                "Publish failed after {} attempts: {}",
                outcome.attempt_count(),
                outcome
                    .terminal_reason
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
        }
        return Ok(ExitCode::FAILURE);
    }

    log::info!(
        "✅ Published {} as {}",
        video.display(),
        outcome.remote_identifier.as_deref().unwrap_or("<unconfirmed>")
    );

    post_publish_cooldown(&config, &cancel).await;
    content::remove_published(&video);

    Ok(ExitCode::SUCCESS)
}

async fn open_history(data_dir: &Path) -> Option<PublishHistory> {
    match PublishHistory::open(&data_dir.join("history.db")).await {
        Ok(history) => Some(history),
        Err(e) => {
            log::warn!("Publish history unavailable (non-critical): {}", e);
            None
        }
    }
}

async fn post_publish_cooldown(config: &Config, cancel: &CancellationToken) {
    let cooldown = random_between(
        &(Duration::from_secs(config.post_publish_cooldown_min_seconds)
            ..=Duration::from_secs(config.post_publish_cooldown_max_seconds)),
    );
    log::info!("Cooling down for {:?} before cleanup", cooldown);

    tokio::select! {
        _ = tokio::time::sleep(cooldown) => {}
        _ = cancel.cancelled() => log::info!("Cooldown interrupted, cleaning up now"),
    }
}
