//! mqtt-pipe - pipe messages between a terminal and an MQTT broker
//!
//! Uses one shared [`MqttConnection`] per invocation, configured from a TOML
//! file with `[connection]`, `[consumer]` and `[producer]` tables.

use clap::{Parser, Subcommand};
use mqtt_connector::config::{ConnectorConfig, ConsumerConfig, ProduceDestination, ProducerConfig};
use mqtt_connector::message::{AdapterMessage, ChannelListener, TOPIC_METADATA_KEY};
use mqtt_connector::observability::init_default_logging;
use mqtt_connector::{password, MqttConnection, MqttConsumer, MqttProducer};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Pipe messages between a terminal and an MQTT broker
#[derive(Parser)]
#[command(name = "mqtt-pipe")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_PIPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and print every message to stdout
    Consume {
        /// Topic filter, overrides [consumer].topic
        #[arg(short, long)]
        topic: Option<String>,
        /// QoS level, overrides [consumer].qos
        #[arg(short, long)]
        qos: Option<u8>,
        /// Exit after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
        /// Print each message as a JSON object with its metadata
        #[arg(long)]
        json: bool,
    },
    /// Publish one payload
    Produce {
        /// Destination topic, overrides [producer].destination
        #[arg(short, long)]
        topic: Option<String>,
        /// QoS level, overrides [producer].qos
        #[arg(short, long)]
        qos: Option<u8>,
        /// Ask the broker to retain the message
        #[arg(short, long)]
        retain: bool,
        payload: String,
    },
    /// Encode a password for use in configuration files
    EncodePassword { password: String },
    /// Validate configuration
    Config {
        /// Print the configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let result = match cli.command {
        Commands::EncodePassword { password } => {
            println!("{}", password::encode(&password));
            Ok(())
        }
        command => match load_configuration(&cli.config) {
            Ok(config) => run(command, config).await,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                process::exit(1);
            }
        },
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<ConnectorConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ConnectorConfig::load_from_file(path)?);
    }

    for path_str in ["mqtt-pipe.toml", "config/mqtt-pipe.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ConnectorConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create mqtt-pipe.toml".into())
}

async fn run(command: Commands, config: ConnectorConfig) -> CliResult {
    match command {
        Commands::Consume {
            topic,
            qos,
            count,
            json,
        } => {
            let mut consumer_config = match (topic, config.consumer.clone()) {
                (Some(topic), Some(existing)) => ConsumerConfig { topic, ..existing },
                (Some(topic), None) => ConsumerConfig::new(topic),
                (None, Some(existing)) => existing,
                (None, None) => return Err("No topic: pass --topic or configure [consumer]".into()),
            };
            if let Some(qos) = qos {
                consumer_config.qos = qos;
            }
            consume(config, consumer_config, count, json).await
        }
        Commands::Produce {
            topic,
            qos,
            retain,
            payload,
        } => {
            let mut producer_config = match (topic, config.producer.clone()) {
                (Some(topic), Some(existing)) => ProducerConfig {
                    destination: ProduceDestination::Configured(topic),
                    ..existing
                },
                (Some(topic), None) => ProducerConfig::new(ProduceDestination::Configured(topic)),
                (None, Some(existing)) => existing,
                (None, None) => {
                    return Err("No destination: pass --topic or configure [producer]".into())
                }
            };
            if let Some(qos) = qos {
                producer_config.qos = qos;
            }
            producer_config.retained |= retain;
            produce(config, producer_config, payload).await
        }
        Commands::Config { show } => {
            if show {
                println!("{}", toml::to_string_pretty(&masked(config))?);
            }
            info!("Configuration validation complete");
            Ok(())
        }
        Commands::EncodePassword { .. } => Ok(()),
    }
}

fn masked(mut config: ConnectorConfig) -> ConnectorConfig {
    if config.connection.password.is_some() {
        config.connection.password = Some("***".to_string());
    }
    let ssl_properties = config
        .connection
        .ssl_properties
        .iter()
        .map(|pair| {
            let value = if pair.key.to_lowercase().contains("password") {
                "***".to_string()
            } else {
                pair.value.clone()
            };
            (pair.key.clone(), value)
        })
        .collect();
    config.connection.ssl_properties = ssl_properties;
    config
}

fn open_connection(config: &ConnectorConfig) -> Result<Arc<MqttConnection>, Box<dyn std::error::Error>> {
    let connection = Arc::new(MqttConnection::new(config.connection.clone()));
    connection.prepare()?;
    connection.init()?;
    connection.start()?;
    Ok(connection)
}

fn render(message: &AdapterMessage, json: bool) -> String {
    if json {
        serde_json::json!({
            "id": message.id,
            "created_at": message.created_at,
            "metadata": message.metadata,
            "payload": message.payload_str(),
        })
        .to_string()
    } else {
        format!(
            "{}\t{}",
            message.metadata_value(TOPIC_METADATA_KEY).unwrap_or_default(),
            message.payload_str()
        )
    }
}

async fn consume(
    config: ConnectorConfig,
    consumer_config: ConsumerConfig,
    count: Option<usize>,
    json: bool,
) -> CliResult {
    let connection = open_connection(&config)?;
    let (sender, mut messages) = mpsc::channel::<AdapterMessage>(100);
    let consumer = MqttConsumer::new(
        connection.clone(),
        consumer_config,
        Arc::new(ChannelListener::new(sender)),
    );

    consumer.init().await?;
    consumer.start().await?;
    info!(topic = %consumer.topic(), "Waiting for messages");

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut received = 0usize;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            message = messages.recv() => {
                let Some(message) = message else { break };
                println!("{}", render(&message, json));
                received += 1;
                if count.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
        }
    }

    consumer.stop().await;
    consumer.close().await;
    connection.close().await;
    Ok(())
}

async fn produce(config: ConnectorConfig, producer_config: ProducerConfig, payload: String) -> CliResult {
    let connection = open_connection(&config)?;
    let producer = MqttProducer::new(connection.clone(), producer_config);

    producer.init().await?;
    producer.start().await?;
    let result = producer.produce(&AdapterMessage::new(payload)).await;

    producer.close().await;
    connection.close().await;
    Ok(result?)
}
