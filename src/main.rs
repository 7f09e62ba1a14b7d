// CrashLink CLI
// Parse telemetry, talk to the broker, or run the full relay against a WiFi device

use clap::{Args, Parser, Subcommand};
use crashlink::bus::{
    topics, BusConfig, BusError, EmergencyAlert, Location, MessageBus, MqttSession,
    OfflineMessageQueue, QoS, Role,
};
use crashlink::device::{
    DeviceLink, LinkConfig, SensorFrame, StaticPeerDirectory, TransportCoordinator, WifiDirectLink,
};
use crashlink::dispatch::DispatchConfig;
use crashlink::recovery::{HostSystem, InMemoryIncidentStore, RecoveryConfig};
use crashlink::storage::QueueJournal;
use crashlink::CrashLinkContext;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crashlink")]
#[command(about = "Crash telemetry relay with offline-tolerant alert publishing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct BrokerArgs {
    /// Broker host
    #[arg(long, default_value = "192.168.0.101")]
    broker_host: String,

    /// Broker port
    #[arg(long, default_value_t = 1883)]
    broker_port: u16,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Persist the offline queue in this directory
    #[arg(long)]
    journal: Option<PathBuf>,
}

impl BrokerArgs {
    fn config(&self) -> BusConfig {
        let config = BusConfig::new().with_broker(&self.broker_host, self.broker_port);
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => config.with_credentials(user, pass),
            _ => config,
        }
    }

    fn bus(&self) -> Result<MessageBus, BusError> {
        let config = self.config();
        let session = Arc::new(MqttSession::new(config.clone()));
        match &self.journal {
            Some(path) => {
                let journal =
                    QueueJournal::open(path).map_err(|e| BusError::Storage(e.to_string()))?;
                let queue = OfflineMessageQueue::with_journal(config.queue_capacity, journal);
                MessageBus::with_queue(config, session, queue)
            }
            None => MessageBus::new(config, session),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse one telemetry line and print the frame
    Parse {
        /// e.g. "ACC:1.0,2.0,3.0|IMPACT:9.5|GPS:40.71,-74.00"
        line: String,
    },

    /// Publish one message
    Publish {
        #[command(flatten)]
        broker: BrokerArgs,

        #[arg(long)]
        topic: String,

        #[arg(long)]
        message: String,

        /// 0, 1 or 2
        #[arg(long, default_value_t = 1)]
        qos: u8,

        #[arg(long)]
        retained: bool,
    },

    /// Subscribe by role and print inbound messages until interrupted
    Listen {
        #[command(flatten)]
        broker: BrokerArgs,

        /// publisher or subscriber
        #[arg(long, default_value = "subscriber")]
        role: Role,

        /// Incident to follow in the publisher role
        #[arg(long)]
        incident: Option<String>,
    },

    /// Publish an emergency alert by hand
    Alert {
        #[command(flatten)]
        broker: BrokerArgs,

        #[arg(long)]
        victim_id: String,

        #[arg(long)]
        victim_name: String,

        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        #[arg(long, default_value = "HIGH")]
        severity: String,
    },

    /// Relay telemetry from WiFi devices and raise alerts on impact
    Run {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Device addresses reachable over WiFi
        #[arg(long = "device", required = true)]
        devices: Vec<String>,

        #[arg(long, default_value_t = 8888)]
        device_port: u16,

        #[arg(long, default_value = "unknown")]
        victim_id: String,

        #[arg(long, default_value = "Unknown")]
        victim_name: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crashlink=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Parse { line } => {
            let frame = SensorFrame::parse(&line);
            println!("{}", serde_json::to_string_pretty(&frame)?);
            println!("{}", frame.summary());
            println!("impact: {}", frame.is_impact());
        }

        Commands::Publish {
            broker,
            topic,
            message,
            qos,
            retained,
        } => {
            let bus = broker.bus()?;
            bus.connect().await?;
            let outcome = bus
                .publish(&topic, message, QoS::from_level(qos), retained)
                .outcome()
                .await;
            println!("{:?}", outcome);
            bus.shutdown().await;
        }

        Commands::Listen {
            broker,
            role,
            incident,
        } => {
            let bus = broker.bus()?;
            bus.connect().await?;
            let subscriptions = topics::subscriptions_for_role(role, incident.as_deref());
            let refs: Vec<&str> = subscriptions.iter().map(String::as_str).collect();
            bus.subscribe(&refs).await?;
            info!(%role, count = refs.len(), "listening");

            let mut inbound = bus.inbound();
            loop {
                tokio::select! {
                    message = inbound.recv() => match message {
                        Ok(message) => {
                            if topics::is_alert_topic(&message.topic) {
                                match EmergencyAlert::from_json(&message.payload) {
                                    Ok(alert) => println!("ALERT {} {:?}", message.topic, alert),
                                    Err(_) => println!("{} {}", message.topic, message.payload_str()),
                                }
                            } else {
                                println!("{} {}", message.topic, message.payload_str());
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "inbound stream lagged");
                        }
                        Err(_) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            bus.shutdown().await;
        }

        Commands::Alert {
            broker,
            victim_id,
            victim_name,
            lat,
            lon,
            severity,
        } => {
            let bus = broker.bus()?;
            bus.connect().await?;
            let incident_id = format!("incident_{}", chrono::Utc::now().timestamp_millis());
            let alert = EmergencyAlert::new(
                &incident_id,
                &victim_id,
                &victim_name,
                Location {
                    latitude: lat,
                    longitude: lon,
                },
            )
            .with_severity(&severity);
            let payload = alert.to_json()?;
            let direct = bus.publish(
                &topics::alert_incident(&incident_id),
                payload.clone(),
                QoS::AtLeastOnce,
                false,
            );
            let fanout = bus.publish(topics::ALERT_BROADCAST, payload, QoS::AtLeastOnce, false);
            println!("{} {:?}", incident_id, direct.outcome().await);
            println!("broadcast {:?}", fanout.outcome().await);
            bus.shutdown().await;
        }

        Commands::Run {
            broker,
            devices,
            device_port,
            victim_id,
            victim_name,
        } => {
            let bus = broker.bus()?;
            let link_config = LinkConfig::new().with_wifi_port(device_port);
            link_config.validate()?;

            let directory = Arc::new(StaticPeerDirectory::new(&devices));
            let links: Vec<Arc<dyn DeviceLink>> =
                vec![Arc::new(WifiDirectLink::new(link_config.clone(), directory))];
            let coordinator = TransportCoordinator::new(&link_config, links);

            let context = CrashLinkContext::new(
                bus,
                coordinator,
                RecoveryConfig::default(),
                DispatchConfig::new(&victim_id, &victim_name),
                Arc::new(InMemoryIncidentStore::new()),
                Arc::new(HostSystem::new()),
            )?;
            context.start();

            if let Err(e) = context.bus().connect().await {
                warn!(error = %e, "broker unavailable, alerts will be queued");
            }
            let subscriptions = topics::subscriptions_for_role(Role::Publisher, None);
            let refs: Vec<&str> = subscriptions.iter().map(String::as_str).collect();
            if let Err(e) = context.bus().subscribe(&refs).await {
                warn!(error = %e, "subscribe failed");
            }

            context.coordinator().start_discovery();
            context.coordinator().wait_for_discovery().await;
            if let Some(device) = context.coordinator().discovered_devices().first() {
                match context.coordinator().connect_to_device(device).await {
                    Ok(kind) => info!(address = %device.address, %kind, "device connected"),
                    Err(e) => warn!(address = %device.address, error = %e, "device connect failed"),
                }
            }

            let mut status = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = status.tick() => {
                        info!(
                            link = %context.coordinator().connection_status(),
                            sensor = %context.coordinator().sensor_data_status(),
                            queued = context.bus().queue().len(),
                            alerts = context.dispatcher().alerts_raised(),
                            "status"
                        );
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            info!("shutting down");
            context.shutdown().await;
        }
    }

    Ok(())
}
