use anyhow::{bail, Context, Result};
use jobcam::capture::{check_permission_detailed, CaptureBackend};
use jobcam::jobs::JobBoard;
use jobcam::signaling::Role;
use jobcam::{
    JobCoordinator, JobStore, LinkConfig, MediaKind, MediaResolver, MemoryJobStore, MemoryRelay,
    NewJob, ParticipantId, ParticipantKind, PublicBucket, SessionState, WebRtcTransport,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    jobcam::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: jobcam-cli <demo|config|permissions> [args]");
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "demo" => cmd_demo(&args).await,
        "config" => cmd_config(&args),
        "permissions" => cmd_permissions(),
        _ => {
            eprintln!("Unknown command: {}", command);
            std::process::exit(1);
        }
    }
}

fn config_path(args: &[String]) -> PathBuf {
    args.iter()
        .skip(2)
        .find(|a| !a.starts_with("--"))
        .map(PathBuf::from)
        .unwrap_or_else(LinkConfig::default_path)
}

fn load_config(args: &[String]) -> Result<LinkConfig> {
    let path = config_path(args);
    let config = LinkConfig::load_layered(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Err(problem) = config.validate() {
        bail!("invalid configuration in {}: {}", path.display(), problem);
    }
    Ok(config)
}

/// config [path]: print the effective configuration
fn cmd_config(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// permissions: report camera access for this process
fn cmd_permissions() -> Result<()> {
    let info = check_permission_detailed();
    println!("Camera permission: {}", info.status);
    println!("{}", info.message);
    Ok(())
}

fn capture_backend() -> Arc<dyn CaptureBackend> {
    #[cfg(feature = "native-camera")]
    {
        Arc::new(jobcam::capture::NokhwaBackend::new())
    }

    #[cfg(not(feature = "native-camera"))]
    {
        Arc::new(jobcam::NoCapture)
    }
}

/// demo [path] [--stun] [--json]: requester and fulfiller in one process
async fn cmd_demo(args: &[String]) -> Result<()> {
    let json = args.iter().any(|a| a == "--json");
    let mut config = load_config(args)?;
    if !args.iter().any(|a| a == "--stun") {
        // Loopback host candidates are enough inside one process.
        config.ice.servers.clear();
    }
    let wait = config.session.negotiation_timeout();
    let assets = PublicBucket::from_config(&config.media);

    let store = Arc::new(MemoryJobStore::new());
    let coordinator = Arc::new(JobCoordinator::new(
        store.clone(),
        Arc::new(MemoryRelay::new()),
        Arc::new(WebRtcTransport::new()),
        capture_backend(),
        config,
    ));
    let lifecycle = coordinator.spawn_lifecycle_watch();
    let board = JobBoard::new(store.clone());
    let sync = board.spawn_sync().await?;

    let requester = ParticipantId::generate(ParticipantKind::Requester);
    let fulfiller = ParticipantId::generate(ParticipantKind::Fulfiller);

    let job = store
        .create_job(
            NewJob::new("Storefront check", "PT", "Lisbon", "Rua Augusta 100")
                .with_budget("50")
                .with_media("briefs/storefront.mp4"),
            requester.clone(),
        )
        .await?;
    println!("Created job {} for {}", job.id, requester);
    if let Some(url) = job.media_ref.as_deref().and_then(|r| assets.public_url(r)) {
        println!("Brief ({:?}): {}", MediaKind::of(&url), url);
    }

    let accepted = coordinator.accept_job(&job.id.to_string(), &fulfiller).await?;
    println!(
        "Job accepted by {} (camera: {})",
        fulfiller,
        if accepted.media_available { "yes" } else { "no" }
    );
    if let Some(warning) = &accepted.warning {
        println!("Warning: {}", warning);
    }

    // The requester listens before the fulfiller offers.
    let viewer = coordinator.watch_live(&job.id).await?;
    let streamer = coordinator.go_live(&job.id).await?;

    let connected = |s: &SessionState| s.is_settled();
    let streamer_state = streamer.wait_for_state(connected, wait).await?;
    let viewer_state = viewer.wait_for_state(connected, wait).await?;

    if json {
        let summary = serde_json::json!({
            "job": job.id,
            "offerer": streamer.stats(),
            "answerer": viewer.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Fulfiller session: {}", streamer_state);
        println!("Requester session: {}", viewer_state);
        println!(
            "Live jobs for requester: {}",
            board.live_jobs_for_requester(&requester).await.len()
        );
    }

    coordinator.leave_live(&job.id, Role::Answerer).await;
    let done = coordinator.complete_job(&job.id.to_string()).await?;
    println!("Job {} is {}", done.id, done.status);

    coordinator.shutdown().await;
    lifecycle.abort();
    sync.abort();

    if streamer_state != SessionState::Connected || viewer_state != SessionState::Connected {
        bail!("sessions did not connect");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_skips_flags() {
        let args = vec![
            "jobcam-cli".to_string(),
            "demo".to_string(),
            "--json".to_string(),
            "custom.toml".to_string(),
        ];
        assert_eq!(config_path(&args), PathBuf::from("custom.toml"));

        let bare = vec!["jobcam-cli".to_string(), "config".to_string()];
        assert_eq!(config_path(&bare), LinkConfig::default_path());
    }

    #[test]
    fn test_permissions_command_reports() {
        assert!(cmd_permissions().is_ok());
        assert!(!check_permission_detailed().message.is_empty());
    }
}
