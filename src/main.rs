//! CLI entry point for peerlink.
//!
//! This binary provides configuration management, a two-node loopback demo,
//! a decoder for signaling messages and a secure channel benchmark.

use anyhow::Result;
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::{info, warn};
use peerlink::{
    app::AppEvent,
    crypto::{Role, SecureChannel},
    network::PeerId,
    signaling::{SignalBody, SignalCodec, SignalMessage},
    transport::MemoryTransport,
    utils::{PeerLinkConfig, DEFAULT_CONFIG_FILE},
    App,
};
use rand::RngCore;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::signal;

/// peerlink - encrypted peer-to-peer sessions over pluggable transports
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "Negotiate, secure and manage peer-to-peer sessions")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Run two loopback nodes that connect and exchange messages
    Demo {
        /// Number of messages each side sends
        #[arg(short, long, default_value = "3")]
        messages: usize,
        /// Give up if the nodes have not connected after this many seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// Keep both nodes running until Ctrl-C
        #[arg(long)]
        wait: bool,
    },
    /// Decode a base64 signaling message and print it as JSON
    Inspect {
        /// Base64 text of the signaling message
        message: String,
        /// Skip sequence and clock-skew checks
        #[arg(long)]
        raw: bool,
    },
    /// Secure channel seal/open throughput
    Benchmark {
        /// Number of messages to seal and open
        #[arg(short, long, default_value = "10000")]
        iterations: usize,
        /// Payload size in bytes
        #[arg(short, long, default_value = "1024")]
        size: usize,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Force overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `config generate` must work even when the current config is broken
    if let Commands::Config {
        action: ConfigCommands::Generate { output, force },
    } = &cli.command
    {
        setup_logging(cli.verbose, cli.quiet, None)?;
        return generate_config(output.clone(), *force);
    }

    let config = PeerLinkConfig::load(cli.config.as_deref())?;
    setup_logging(cli.verbose, cli.quiet, Some(config.logging.level.as_str()))?;

    match cli.command {
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Demo {
            messages,
            timeout,
            wait,
        } => handle_demo_command(messages, Duration::from_secs(timeout), wait, config).await,
        Commands::Inspect { message, raw } => handle_inspect_command(&message, raw, &config),
        Commands::Benchmark { iterations, size } => handle_benchmark_command(iterations, size, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: Option<&str>) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured.unwrap_or("info"),
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    Ok(())
}

fn generate_config(output: Option<PathBuf>, force: bool) -> Result<()> {
    let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if output_path.exists() && !force {
        return Err(anyhow::anyhow!(
            "{} already exists. Use --force to overwrite.",
            output_path.display()
        ));
    }

    PeerLinkConfig::default().save(&output_path)?;
    println!("✓ Configuration generated: {}", output_path.display());
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &PeerLinkConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output, force } => generate_config(output, force)?,
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                PeerLinkConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            if let Some(section_name) = section {
                let value = toml::Value::try_from(config)?;
                let section_value = value
                    .get(&section_name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown configuration section: {}", section_name))?;
                let mut table = toml::map::Map::new();
                table.insert(section_name, section_value.clone());
                println!("{}", toml::to_string_pretty(&table)?);
            } else {
                println!("{}", config.to_toml_string()?);
            }
        }
    }
    Ok(())
}

async fn handle_demo_command(messages: usize, timeout: Duration, wait: bool, config: PeerLinkConfig) -> Result<()> {
    let transport = MemoryTransport::new();
    let hub = peerlink::signaling::SignalingHub::new();

    let node_config = |local: &str, remote: &str| {
        let mut node = config.clone();
        node.discovery.local_peer_id = Some(local.to_string());
        node.discovery.static_peers = vec![remote.to_string()];
        node.discovery.auto_connect = true;
        node
    };
    let alice = App::on_loopback(node_config("alice", "bob"), &transport, &hub)?;
    let bob = App::on_loopback(node_config("bob", "alice"), &transport, &hub)?;
    let alice_id = alice.local_peer().clone();
    let bob_id = bob.local_peer().clone();

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();
    let runners = [alice.clone(), bob.clone()].map(|node| tokio::spawn(async move { node.run().await }));

    info!("Waiting for {} and {} to connect", alice_id, bob_id);
    tokio::time::timeout(timeout, async {
        wait_connected(&mut alice_events).await;
        wait_connected(&mut bob_events).await;
    })
    .await
    .map_err(|_| anyhow::anyhow!("Nodes did not connect within {:?}", timeout))?;
    println!("✓ Session established between {} and {}", alice_id, bob_id);

    for i in 0..messages {
        alice.send_message(&bob_id, format!("hello #{} from {}", i, alice_id).as_bytes())?;
        bob.send_message(&alice_id, format!("hello #{} from {}", i, bob_id).as_bytes())?;
    }

    tokio::time::timeout(timeout, async {
        let (a, b) = tokio::join!(
            print_messages(&mut alice_events, messages),
            print_messages(&mut bob_events, messages)
        );
        a.and(b)
    })
    .await
    .map_err(|_| anyhow::anyhow!("Messages were not delivered within {:?}", timeout))??;

    for node in [&alice, &bob] {
        let stats = node.stats().await;
        for session in stats.sessions {
            println!(
                "{} <-> {}: {} sent, {} received, key {}",
                stats.peer_id,
                session.peer_id,
                session.sent,
                session.received,
                session.key_fingerprint.as_deref().unwrap_or("-")
            );
        }
    }

    if wait {
        println!("Nodes running. Press Ctrl-C to stop.");
        signal::ctrl_c().await?;
        info!("Shutdown signal received");
    }

    alice.shutdown();
    bob.shutdown();
    for runner in runners {
        runner.await??;
    }
    println!("✓ Demo finished");
    Ok(())
}

async fn wait_connected(events: &mut tokio::sync::broadcast::Receiver<AppEvent>) {
    while let Ok(event) = events.recv().await {
        if matches!(event, AppEvent::PeerConnected { .. }) {
            return;
        }
    }
}

async fn print_messages(events: &mut tokio::sync::broadcast::Receiver<AppEvent>, expected: usize) -> Result<()> {
    let mut seen = 0;
    while seen < expected {
        match events.recv().await? {
            AppEvent::MessageReceived { peer_id, content } => {
                seen += 1;
                println!("[{}] {}", peer_id, String::from_utf8_lossy(&content));
            }
            AppEvent::PeerDisconnected { peer_id, state, reason } => {
                warn!("Session with {} ended early ({}): {:?}", peer_id, state, reason);
                return Err(anyhow::anyhow!("session with {} ended before all messages arrived", peer_id));
            }
            _ => {}
        }
    }
    Ok(())
}

fn handle_inspect_command(message: &str, raw: bool, config: &PeerLinkConfig) -> Result<()> {
    let decoded = if raw {
        let bytes = general_purpose::STANDARD.decode(message.trim())?;
        SignalMessage::from_bytes(&bytes, config.signaling.max_message_size)?
    } else {
        SignalCodec::new(config.signaling.clone()).decode_text(message)?
    };

    let detail = match &decoded.body {
        SignalBody::Descriptor(descriptor) => serde_json::json!({
            "role": descriptor.role().to_string(),
            "sequence": descriptor.sequence(),
            "in_reply_to": descriptor.in_reply_to(),
            "connectivity": hex::encode(descriptor.connectivity()),
            "candidates": descriptor
                .candidates()
                .iter()
                .map(|c| hex::encode(&c.payload))
                .collect::<Vec<_>>(),
        }),
        SignalBody::Candidate(candidate) => serde_json::json!({
            "candidate": hex::encode(&candidate.payload),
        }),
    };

    let output = serde_json::json!({
        "version": decoded.version,
        "kind": decoded.kind_name(),
        "from": decoded.from,
        "to": decoded.to,
        "body": detail,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn handle_benchmark_command(iterations: usize, size: usize, config: &PeerLinkConfig) -> Result<()> {
    println!("Sealing and opening {} messages of {} bytes...", iterations, size);

    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let alice_id = PeerId::parse("bench-alice")?;
    let bob_id = PeerId::parse("bench-bob")?;

    let start = Instant::now();
    let mut alice = SecureChannel::derive(&secret, &bob_id, Role::Initiator, &config.crypto)?;
    let mut bob = SecureChannel::derive(&secret, &alice_id, Role::Responder, &config.crypto)?;
    println!("Key derivation: {:?}", start.elapsed());
    println!("Key fingerprint: {}", alice.keys().fingerprint());

    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);

    let start = Instant::now();
    let mut wire_bytes = 0usize;
    for _ in 0..iterations {
        let envelope = alice.seal(&payload, &alice_id)?;
        let frame = envelope.to_bytes()?;
        wire_bytes += frame.len();
        let decoded = peerlink::crypto::EncryptedEnvelope::from_bytes(&frame)?;
        let opened = bob.open(&decoded)?;
        if opened.len() != payload.len() {
            return Err(anyhow::anyhow!("round trip changed the payload length"));
        }
    }
    let duration = start.elapsed();

    let per_sec = iterations as f64 / duration.as_secs_f64();
    println!("Seal+open: {:.2} msgs/sec", per_sec);
    println!("Throughput: {:.2} MiB/sec", per_sec * size as f64 / (1024.0 * 1024.0));
    if iterations > 0 {
        println!("Envelope overhead: {} bytes", wire_bytes / iterations - size);
    }
    println!("Channel stats: {:?}", bob.stats());
    Ok(())
}
