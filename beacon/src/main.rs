//! beacon - command-line client for activity tracking servers
//!
//! This tool provides commands for:
//! - Checking configuration and the offline request queues
//! - Listing buckets and events on the server
//! - Sending heartbeats, directly or through the offline queue
//! - Flushing queued heartbeats once the server is reachable
//!
//! Uses XDG Base Directory specification for file locations:
//! - Queues: $XDG_DATA_HOME/beacon/queued/ (~/.local/share/beacon/queued/)
//! - Config: $XDG_CONFIG_HOME/beacon/config.toml (~/.config/beacon/config.toml)
//! - Logs: $XDG_STATE_HOME/beacon/beacon.log.YYYY-MM-DD (with --verbose)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use beacon_core::queue::{discover_stores, RequestStore};
use beacon_core::{Client, Config, Event, EventData};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Offline-tolerant heartbeat client for activity tracking servers")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Talk to the testing server
    #[arg(long, global = true)]
    testing: bool,

    /// Client name; also names the offline queue
    #[arg(long, global = true, default_value = "beacon-cli")]
    client: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and queued requests
    Status,

    /// List buckets on the server
    Buckets,

    /// Show the most recent events in a bucket
    Events {
        bucket: String,

        /// Maximum number of events
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Send a heartbeat stamped with the current time
    Heartbeat {
        bucket: String,

        /// Event data as a JSON object
        #[arg(short, long)]
        data: String,

        /// Pulse tolerance in seconds (default: from config)
        #[arg(short, long)]
        pulsetime: Option<f64>,

        /// Store in the offline queue instead of sending now
        #[arg(short, long)]
        queued: bool,
    },

    /// Create a bucket on the server
    CreateBucket {
        id: String,

        /// Event type stored in the bucket, e.g. "currentwindow"
        event_type: String,
    },

    /// Deliver queued requests, waiting for the server if needed
    Flush {
        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 60)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    // Keep the guard alive for the whole run so buffered lines are flushed
    let _log_guard = if args.verbose {
        Some(beacon_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config, args.testing),
        Command::Buckets => cmd_buckets(&build_client(&args.client, &config, args.testing)?),
        Command::Events { ref bucket, limit } => {
            cmd_events(&build_client(&args.client, &config, args.testing)?, bucket, limit)
        }
        Command::Heartbeat {
            ref bucket,
            ref data,
            pulsetime,
            queued,
        } => {
            let client = build_client(&args.client, &config, args.testing)?;
            let pulsetime = pulsetime.unwrap_or(config.queue.default_pulsetime_secs);
            cmd_heartbeat(&client, bucket, data, pulsetime, queued)
        }
        Command::CreateBucket {
            ref id,
            ref event_type,
        } => cmd_create_bucket(&build_client(&args.client, &config, args.testing)?, id, event_type),
        Command::Flush { timeout } => {
            let mut client = build_client(&args.client, &config, args.testing)?;
            cmd_flush(&mut client, Duration::from_secs(timeout))
        }
    }
}

fn build_client(name: &str, config: &Config, testing: bool) -> Result<Client> {
    Client::builder(name)
        .config(config.clone())
        .testing(testing)
        .build()
        .context("failed to create client")
}

fn cmd_status(config: &Config, testing: bool) -> Result<()> {
    println!("Beacon Configuration");
    println!("====================");
    println!();

    let server = config.server_for(testing);
    println!("Server:          {}", server.api_url());
    println!("Mode:            {}", if testing { "testing" } else { "production" });
    println!("Timeout:         {}s", server.timeout_secs);
    println!("Reconnect:       {}s", config.queue.reconnect_interval_secs);
    println!("Poll Interval:   {}ms", config.queue.poll_interval_ms);
    println!("Compaction:      {}", config.queue.compact_on_reconnect);
    println!("Pulsetime:       {}s (fallback)", config.queue.default_pulsetime_secs);

    let queue_dir = Config::queue_dir();
    println!();
    println!("Queue Directory: {}", queue_dir.display());
    println!("Log Directory:   {}", Config::state_dir().display());

    let stores = discover_stores(&queue_dir).context("failed to list queue stores")?;
    if stores.is_empty() {
        println!("No queued requests");
        return Ok(());
    }

    println!();
    println!("{:<24} {:>8}", "CLIENT", "QUEUED");
    for (name, path) in stores {
        let store = RequestStore::open(&path)
            .with_context(|| format!("failed to open queue store {}", path.display()))?;
        println!("{:<24} {:>8}", name, store.len()?);
    }

    Ok(())
}

fn cmd_buckets(client: &Client) -> Result<()> {
    let buckets = client.get_buckets().context("failed to list buckets")?;
    if buckets.is_empty() {
        println!("No buckets");
        return Ok(());
    }

    let mut ids: Vec<&String> = buckets.keys().collect();
    ids.sort();

    println!("{:<32} {:<20} {:<20}", "ID", "TYPE", "CLIENT");
    for id in ids {
        let bucket = &buckets[id];
        println!(
            "{:<32} {:<20} {:<20}",
            bucket.id, bucket.event_type, bucket.client
        );
    }

    Ok(())
}

fn cmd_events(client: &Client, bucket: &str, limit: usize) -> Result<()> {
    let events = client
        .get_events(bucket, Some(limit), None, None)
        .with_context(|| format!("failed to fetch events for {}", bucket))?;

    if events.is_empty() {
        println!("No events in {}", bucket);
        return Ok(());
    }

    for event in events {
        println!(
            "{}  {:>8.1}s  {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.duration,
            serde_json::Value::Object(event.data)
        );
    }

    Ok(())
}

fn cmd_heartbeat(client: &Client, bucket: &str, data: &str, pulsetime: f64, queued: bool) -> Result<()> {
    let data: EventData =
        serde_json::from_str(data).context("--data must be a JSON object")?;
    let event = Event::new(chrono::Utc::now(), data);

    match client.heartbeat(bucket, &event, pulsetime, queued)? {
        Some(merged) => {
            println!(
                "Heartbeat merged: started {}, duration {:.1}s",
                merged.timestamp.format("%Y-%m-%d %H:%M:%S"),
                merged.duration
            );
        }
        None => {
            println!(
                "Heartbeat queued ({} waiting in {})",
                client.queued_len()?,
                client.queue_path().display()
            );
        }
    }

    Ok(())
}

fn cmd_create_bucket(client: &Client, id: &str, event_type: &str) -> Result<()> {
    client
        .create_bucket(id, event_type, false)
        .with_context(|| format!("failed to create bucket {}", id))?;
    println!("Created bucket {} ({})", id, event_type);
    Ok(())
}

fn cmd_flush(client: &mut Client, timeout: Duration) -> Result<()> {
    let pending = client.queued_len()?;
    if pending == 0 {
        println!("Queue is empty");
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nStopping...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    println!(
        "Flushing {} queued request(s) for {}. Press Ctrl+C to stop.",
        pending,
        client.name()
    );

    client.connect().context("failed to start request queue")?;

    let deadline = Instant::now() + timeout;
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        let status = client.queue_status()?;
        if status.queued == 0 {
            break;
        }
        if let Some(err) = status.fatal_error {
            bail!("request queue stopped: {}", err);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let stats = client.disconnect().context("request queue failed")?;
    let remaining = client.queued_len()?;
    tracing::info!(remaining, stats = ?stats, "Flush finished");

    if let Some(stats) = stats {
        println!();
        println!("Delivered:       {}", stats.delivered);
        println!("Compacted:       {}", stats.requests_compacted);
        println!("Failed Probes:   {}", stats.backoff_waits);
    }

    if remaining == 0 {
        println!("Flush complete");
    } else {
        println!("{} request(s) still queued", remaining);
    }

    Ok(())
}
