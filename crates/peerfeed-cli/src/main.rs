//! PeerFeed CLI
//!
//! Thin wrapper around peerfeed-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show our peer id
//! peerfeed info
//!
//! # Write and sign a post
//! peerfeed post "Planted the tomatoes today"
//!
//! # Read every accepted post, newest first
//! peerfeed feed
//!
//! # Edit the local profile
//! peerfeed profile set --name "Love" --bio "Grows things"
//!
//! # Follow a peer and pull its feed once
//! peerfeed connect <peer_id> 192.168.1.7:4433
//!
//! # Run as a long-lived node
//! peerfeed serve --port 4433
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use peerfeed_core::{
    beginning_of_time, FeedNode, NodeConfig, NodeEvent, PeerId, Post, Profile, Transport,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// PeerFeed - serverless signed feeds
#[derive(Parser)]
#[command(name = "peerfeed")]
#[command(version)]
#[command(about = "PeerFeed - serverless signed feeds")]
#[command(
    long_about = "Replicates signed posts and profiles directly between peers. Every post is verified against its author's key before it is stored."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.peerfeed)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Seconds between background sync passes
    #[arg(long, global = true, default_value_t = 30)]
    sync_interval_secs: u64,

    /// UDP port to bind (0 picks an ephemeral port)
    #[arg(short, long, global = true, default_value_t = 0)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Create and sign a post
    Post {
        /// Post text
        content: String,
    },

    /// List every accepted post, newest first
    Feed {
        /// Show at most this many posts
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Profile management
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// List known peers
    Peers,

    /// Connect to a peer, sync it once, and exit
    Connect {
        /// Peer ID (base58)
        peer_id: String,
        /// Socket addresses to dial (ip:port)
        addresses: Vec<String>,
    },

    /// Reconnect to known peers and run one sync pass
    Sync,

    /// Run a persistent node until Ctrl+C
    Serve,
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Show the local profile, or a known peer's
    Show {
        /// Peer ID (base58); omit for our own profile
        peer_id: Option<String>,
    },
    /// Update display name and bio
    Set {
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Biography
        #[arg(long)]
        bio: Option<String>,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.peerfeed)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerfeed")
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "(unsaved)".to_string())
}

fn print_post(post: &Post, local_peer: &str) {
    let author = if post.author_id == local_peer {
        "you".to_string()
    } else {
        short(&post.author_id)
    };
    println!("[{}] {}", format_time(post.created_at), author);
    for line in post.content.lines() {
        println!("    {}", line);
    }
    if !post.attachments.is_empty() {
        println!("    ({} attachment(s))", post.attachments.len());
    }
}

fn print_profile(profile: &Profile) {
    println!("Profile:");
    println!("  Peer ID: {}", profile.peer_id);
    let name = if profile.display_name.is_empty() {
        "(unset)"
    } else {
        profile.display_name.as_str()
    };
    println!("  Name: {}", name);
    if !profile.bio.is_empty() {
        println!("  Bio: {}", profile.bio);
    }
    if profile.addresses.is_empty() {
        println!("  Addresses: (none)");
    } else {
        println!("  Addresses:");
        for addr in &profile.addresses {
            println!("    - {}", addr);
        }
    }
}

fn short(peer_id: &str) -> String {
    PeerId::parse(peer_id)
        .map(|peer| peer.fmt_short())
        .unwrap_or_else(|_| peer_id.to_string())
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::FeedUpdated { post_id } => println!("[Event] New local post {}", post_id),
        NodeEvent::PeerConnected { peer_id } => {
            println!("[Event] Peer connected: {}", peer_id)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = NodeConfig::new(&data_dir)
        .with_sync_interval(Duration::from_secs(cli.sync_interval_secs.max(1)))
        .with_bind_port(cli.port);

    match cli.command {
        Commands::Info => {
            let node = FeedNode::open_offline(&config)?;
            let posts = node.list_all_posts()?;
            let local = node.storage().get_local_posts(beginning_of_time())?;
            let peers = node.storage().get_known_peers()?;

            println!("PeerFeed v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Identity:");
            println!("  Peer ID: {}", node.local_peer());
            println!();
            println!("Data directory: {}", config.data_dir.display());
            println!("Posts: {} ({} authored here)", posts.len(), local.len());
            println!("Known peers: {}", peers.len());
        }

        Commands::Post { content } => {
            let node = FeedNode::open_offline(&config)?;
            let post = node.create_and_sign_local_post(&content)?;
            println!("Posted: {}", post.id);
        }

        Commands::Feed { limit } => {
            let node = FeedNode::open_offline(&config)?;
            let posts = node.list_all_posts()?;
            if posts.is_empty() {
                println!("No posts yet.");
            } else {
                let local_peer = node.local_peer().to_string();
                let shown = limit.unwrap_or(posts.len()).min(posts.len());
                println!("Feed ({} of {}):", shown, posts.len());
                for post in posts.iter().take(shown) {
                    println!();
                    print_post(post, &local_peer);
                }
            }
        }

        Commands::Profile { action } => {
            let node = FeedNode::open_offline(&config)?;
            match action {
                ProfileAction::Show { peer_id: None } => {
                    print_profile(&node.get_local_profile()?);
                }
                ProfileAction::Show {
                    peer_id: Some(peer_id),
                } => {
                    print_profile(&node.get_remote_profile(&peer_id)?);
                }
                ProfileAction::Set { name, bio } => {
                    if name.is_none() && bio.is_none() {
                        anyhow::bail!("Nothing to update; pass --name and/or --bio");
                    }
                    let current = node.get_local_profile()?;
                    let profile = node.set_local_profile(
                        name.as_deref().unwrap_or(&current.display_name),
                        bio.as_deref().unwrap_or(&current.bio),
                    )?;
                    println!("Profile updated.");
                    print_profile(&profile);
                }
            }
        }

        Commands::Peers => {
            let node = FeedNode::open_offline(&config)?;
            let peers = node.list_known_peers_with_connectivity()?;
            if peers.is_empty() {
                println!("No known peers.");
            } else {
                println!("Known peers ({}):", peers.len());
                for peer in peers {
                    let name = if peer.profile.display_name.is_empty() {
                        "(unnamed)"
                    } else {
                        peer.profile.display_name.as_str()
                    };
                    println!("  {} {}", peer.profile.peer_id, name);
                    for addr in &peer.profile.addresses {
                        println!("    - {}", addr);
                    }
                }
            }
        }

        Commands::Connect { peer_id, addresses } => {
            if addresses.is_empty() {
                anyhow::bail!("At least one address is required to connect");
            }
            let node = FeedNode::open(&config).await?;
            let result = connect_once(&node, &peer_id, addresses).await;
            node.shutdown().await;
            result?;
        }

        Commands::Sync => {
            let node = FeedNode::open(&config).await?;
            let result = async {
                node.publish_addresses()?;
                let reached = node.reconnect_known_peers().await?;
                let report = node.sync_report_now().await?;
                anyhow::Ok((reached, report))
            }
            .await;
            node.shutdown().await;

            let (reached, report) = result?;
            println!("Reconnected to {} peer(s).", reached);
            println!("Sync pass: {}", report);
            println!("Synced {} peer(s).", report.synced);
        }

        Commands::Serve => {
            println!("Starting PeerFeed...");
            println!();

            let node = FeedNode::open(&config).await?;
            let mut events = node.subscribe_events();
            let shutdown = CancellationToken::new();
            node.start(shutdown.clone())?;

            println!("Identity:");
            println!("  Peer ID: {}", node.local_peer());
            println!();
            println!("Listening on:");
            for addr in node.transport().local_addresses() {
                println!("  {}", addr);
            }
            println!();
            println!("Data directory: {}", config.data_dir.display());
            println!("Sync interval: {}s", node.scheduler().interval().as_secs());
            println!();

            let reached = node.reconnect_known_peers().await?;
            println!("Reconnected to {} known peer(s).", reached);
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(RecvError::Lagged(missed)) => {
                            println!("[Event] ({} event(s) missed)", missed);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            println!("Shutting down...");
            shutdown.cancel();
            node.shutdown().await;
            println!("Goodbye.");
        }
    }

    Ok(())
}

/// Connect, pull the peer's feed and profile, and report what arrived
async fn connect_once<T: Transport>(
    node: &FeedNode<T>,
    peer_id: &str,
    addresses: Vec<String>,
) -> Result<()> {
    node.publish_addresses()?;
    let peer = node
        .connect_peer(peer_id, addresses)
        .await
        .with_context(|| format!("Failed to connect to {}", peer_id))?;
    println!("Connected to {}", peer);

    let accepted = node.sync_peer(peer_id).await?;
    println!("Fetched {} verified post(s).", accepted.len());

    match node.syncer().fetch_profile(&peer).await {
        Ok(profile) if !profile.display_name.is_empty() => {
            println!("Peer name: {}", profile.display_name);
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(peer = %peer, error = ?e, "Profile fetch failed"),
    }
    Ok(())
}
