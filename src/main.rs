//! rntbd - RNTBD transport tooling
//!
//! Probes replica connectivity and computes effective partition keys.

use clap::{Parser, Subcommand, ValueEnum};
use rntbd_client::{Channel, ServerAddress, TransportContext, TransportOptions};
use rntbd_routing::{PartitionKeyDefinition, PartitionKeyDefinitionVersion, PartitionKeyInternal};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rntbd")]
#[command(about = "RNTBD transport tooling")]
#[command(version)]
struct Cli {
    // ===== TLS Options =====
    /// Enable TLS
    #[arg(long, env = "RNTBD_TLS_ENABLED")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "RNTBD_TLS_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to the replica host)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a channel to a replica and report what it negotiated
    Probe {
        /// Replica URI, e.g. rntbd://host:port/path/
        uri: String,
    },

    /// Compute the effective partition key of a JSON partition key
    Epk {
        /// Partitioning kind
        #[arg(long, value_enum, default_value = "hash")]
        kind: Kind,

        /// Partition key definition version
        #[arg(long, default_value = "2", value_parser = clap::value_parser!(u8).range(1..=2))]
        version: u8,

        /// Number of paths in the definition (defaults to the key's component count)
        #[arg(long)]
        paths: Option<usize>,

        /// Partition key as a JSON array, e.g. '["tenant", 7]'
        key: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Hash,
    Multihash,
    Range,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Probe { uri } => probe(&cli, uri).await,
        Commands::Epk {
            kind,
            version,
            paths,
            key,
        } => {
            let epk = effective_partition_key(*kind, *version, *paths, key)?;
            println!("{}", epk);
            Ok(())
        }
    }
}

fn load_options(cli: &Cli) -> Result<TransportOptions, Box<dyn std::error::Error>> {
    // File from RNTBD_CONFIG if set, then env overrides
    let mut options = match TransportOptions::load() {
        Ok(options) => options,
        Err(e) => {
            if std::env::var("RNTBD_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Ignoring invalid environment overrides: {}", e);
            TransportOptions::default()
        }
    };

    if cli.tls || cli.ca_cert.is_some() || cli.insecure {
        options.tls.enabled = true;
    }
    if let Some(path) = &cli.ca_cert {
        options.tls.ca_cert_path = Some(path.clone());
    }
    options.tls.insecure |= cli.insecure;
    if let Some(name) = &cli.server_name {
        options.tls.server_name = Some(name.clone());
    }
    Ok(options)
}

async fn probe(cli: &Cli, uri: &str) -> Result<(), Box<dyn std::error::Error>> {
    let address = ServerAddress::parse(uri)?;
    let context = TransportContext::new(load_options(cli)?)?;
    let channel = Channel::new(address.clone(), context);

    tracing::info!("Probing {}...", address);
    let started = Instant::now();
    let opened = channel.open().await;
    let elapsed = started.elapsed();

    let result = match opened {
        Ok(()) => {
            println!("address:     {}", address);
            if let Some(connection) = channel.connection_description() {
                println!("connection:  {}", connection);
            }
            if let Some(server) = channel.server_properties() {
                println!("server:      {} {}", server.agent, server.version);
                if let Some(idle) = server.idle_timeout {
                    println!("idle:        {:?}", idle);
                }
            }
            println!("healthy:     {}", channel.healthy());
            println!("open time:   {:?}", elapsed);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            if let Some(negotiation) = &e.negotiation {
                eprintln!("  status: {}", negotiation.status);
                if let Some(version) = &negotiation.required_client_version {
                    eprintln!("  server requires client version {}", version);
                }
            }
            Err(e.into())
        }
    };
    channel.close();
    result
}

fn effective_partition_key(
    kind: Kind,
    version: u8,
    paths: Option<usize>,
    key: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let key = PartitionKeyInternal::from_json(key)?;
    let version = PartitionKeyDefinitionVersion::try_from(version)?;
    let path_count = paths.unwrap_or_else(|| key.components().len().max(1));
    let path_names: Vec<String> = (0..path_count).map(|i| format!("/p{}", i)).collect();

    let definition = match kind {
        Kind::Hash => PartitionKeyDefinition::hash(path_names[0].clone(), version),
        Kind::Multihash => PartitionKeyDefinition::multi_hash(path_names),
        Kind::Range => PartitionKeyDefinition::range(path_names[0].clone()),
    };
    Ok(key.effective_partition_key(&definition)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "rntbd", "epk", "--kind", "multihash", "--version", "2", "--paths", "3", r#"["a"]"#,
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Epk {
                kind: Kind::Multihash,
                version: 2,
                paths: Some(3),
                ..
            }
        ));

        assert!(Cli::try_parse_from(["rntbd", "epk", "--version", "3", "[1]"]).is_err());
        assert!(Cli::try_parse_from(["rntbd", "probe", "rntbd://h:1/"]).is_ok());
    }

    #[test]
    fn test_effective_partition_key_boundaries() {
        assert_eq!(effective_partition_key(Kind::Hash, 2, None, "[]").unwrap(), "");
        assert_eq!(
            effective_partition_key(Kind::Hash, 1, None, r#""Infinity""#).unwrap(),
            "FF"
        );
        assert!(effective_partition_key(Kind::Hash, 1, Some(1), "[1, 2]").is_err());
    }

    #[test]
    fn test_effective_partition_key_matches_library() {
        let key = PartitionKeyInternal::from_json(r#"["tenant"]"#).unwrap();
        let expected = key
            .effective_partition_key(&PartitionKeyDefinition::hash(
                "/pk",
                PartitionKeyDefinitionVersion::V2,
            ))
            .unwrap();
        assert_eq!(
            effective_partition_key(Kind::Hash, 2, None, r#"["tenant"]"#).unwrap(),
            expected
        );
    }
}
