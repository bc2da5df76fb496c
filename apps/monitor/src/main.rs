use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::DEFAULT_CONFIG_FILE, load_settings, transport::TorrentUpload, view::DashboardView,
    MonitorEvent, TorrentMonitor,
};
use shared::domain::{SpeedLimits, TorrentId};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "torrent-monitor", about = "Watch and control a torrent backend")]
struct Args {
    /// Overrides `api_base_url` from the config file and environment.
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Live dashboard fed by polling and the push channel.
    Watch {
        #[arg(long, default_value_t = 2)]
        redraw_secs: u64,
    },
    /// Print one snapshot and exit.
    List,
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
    Delete {
        id: String,
    },
    /// Per-torrent limits in bytes/s; an omitted side becomes unlimited.
    Limits {
        id: String,
        #[arg(long)]
        download: Option<u64>,
        #[arg(long)]
        upload: Option<u64>,
    },
    GlobalLimits {
        #[arg(long)]
        download: Option<u64>,
        #[arg(long)]
        upload: Option<u64>,
    },
    Upload {
        path: PathBuf,
        #[arg(long)]
        download: Option<u64>,
        #[arg(long)]
        upload: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    let monitor = TorrentMonitor::new(settings);

    match args.command {
        Command::Watch { redraw_secs } => watch(&monitor, redraw_secs).await,
        Command::List => {
            monitor.refresh().await?;
            print_view(&monitor.view());
            Ok(())
        }
        Command::Pause { id } => {
            let id = known_torrent(&monitor, id).await?;
            monitor.dispatcher().pause(&id).await?;
            confirm(&monitor, "pause", &id).await
        }
        Command::Resume { id } => {
            let id = known_torrent(&monitor, id).await?;
            monitor.dispatcher().resume(&id).await?;
            confirm(&monitor, "resume", &id).await
        }
        Command::Delete { id } => {
            let id = known_torrent(&monitor, id).await?;
            monitor.dispatcher().delete(&id).await?;
            confirm(&monitor, "delete", &id).await
        }
        Command::Limits {
            id,
            download,
            upload,
        } => {
            let id = known_torrent(&monitor, id).await?;
            monitor
                .dispatcher()
                .set_limits(&id, SpeedLimits::new(download, upload))
                .await?;
            confirm(&monitor, "limits", &id).await
        }
        Command::GlobalLimits { download, upload } => {
            monitor
                .dispatcher()
                .set_global_limits(SpeedLimits::new(download, upload))
                .await?;
            println!("global limits updated");
            Ok(())
        }
        Command::Upload {
            path,
            download,
            upload,
        } => {
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .context("upload path has no usable file name")?
                .to_string();
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let upload = TorrentUpload::new(filename, bytes)
                .with_limits(SpeedLimits::new(download, upload));
            let id = monitor.dispatcher().upload(upload).await?;
            println!("uploaded as {id}");
            Ok(())
        }
    }
}

/// Load a snapshot so the target can be checked and projected.
async fn known_torrent(monitor: &TorrentMonitor, id: String) -> Result<TorrentId> {
    monitor.refresh().await?;
    let id = TorrentId::from(id);
    if monitor.store().get(&id).is_none() {
        bail!("no torrent with id {id}");
    }
    Ok(id)
}

/// Re-poll until the command is confirmed or goes stale.
async fn confirm(monitor: &TorrentMonitor, action: &str, id: &TorrentId) -> Result<()> {
    println!("{action} accepted for {id}");
    let mut events = monitor.subscribe_events();
    let interval = monitor.settings().poll.interval;
    let cycles = monitor.settings().reconcile.max_retries + 2;
    for _ in 0..cycles {
        tokio::time::sleep(interval).await;
        monitor.refresh().await?;
        while let Ok(event) = events.try_recv() {
            match event {
                MonitorEvent::CommandConfirmed { intent } if intent.target == *id => {
                    println!("{action} confirmed for {id}");
                    return Ok(());
                }
                MonitorEvent::CommandStale(stale) if stale.intent.target == *id => {
                    bail!("{action} for {id} was never reflected by the backend");
                }
                MonitorEvent::CommandFailed { intent, message } if intent.target == *id => {
                    bail!("{action} for {id} failed: {message}");
                }
                _ => {}
            }
        }
    }
    println!("{action} for {id} still pending");
    Ok(())
}

async fn watch(monitor: &TorrentMonitor, redraw_secs: u64) -> Result<()> {
    let mut events = monitor.subscribe_events();
    monitor.start()?;
    let mut redraw = tokio::time::interval(Duration::from_secs(redraw_secs.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = redraw.tick() => {
                println!("[{:?}]", monitor.channel_state());
                print_view(&monitor.view());
            }
            event = events.recv() => match event {
                Ok(MonitorEvent::CommandFailed { intent, message }) => {
                    eprintln!("{} {} failed: {message}", intent.kind.name(), intent.target);
                }
                Ok(MonitorEvent::CommandStale(stale)) => eprintln!("{stale}"),
                Ok(MonitorEvent::UploadFailed { filename, message }) => {
                    eprintln!("upload of {filename} failed: {message}");
                }
                Ok(MonitorEvent::GlobalLimitsFailed { message, .. }) => {
                    eprintln!("global limits failed: {message}");
                }
                _ => {}
            },
        }
    }

    monitor.stop();
    Ok(())
}

fn print_view(view: &DashboardView) {
    println!("{}", view.summary_line());
    if let Some(server) = &view.server_stats {
        println!(
            "backend reports {} torrents, {} active, {} completed",
            server.total_downloads, server.active_downloads, server.completed_downloads
        );
    }
    println!(
        "{:<24} {:<34} {:<20} {:>7} {:>11} {:>13} {:>13} {:>9} {:>13} {:>13}",
        "ID", "NAME", "STATUS", "PROG", "SIZE", "DOWN", "UP", "ETA", "DOWN LIMIT", "UP LIMIT"
    );
    for row in &view.rows {
        println!(
            "{:<24} {:<34} {:<20} {:>7} {:>11} {:>13} {:>13} {:>9} {:>13} {:>13}",
            truncate(row.id.as_str(), 24),
            truncate(&row.name, 34),
            row.status.label(),
            row.progress,
            row.size,
            row.download_rate,
            row.upload_rate,
            row.eta,
            row.download_limit,
            row.upload_limit,
        );
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut cut: String = value.chars().take(width.saturating_sub(1)).collect();
    cut.push('~');
    cut
}
