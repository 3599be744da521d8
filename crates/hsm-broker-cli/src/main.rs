//! HSM Broker CLI
//!
//! Sends transactions to a payment HSM through the pooled, correlating
//! broker. Useful for smoke-testing a device and its key configuration.

use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hsm_broker_core::config::{Config, LoggingConfig};
use hsm_broker_core::hsm::{diagnostics, PinKeys, PinService, PinVerification};
use hsm_broker_core::metrics::BrokerMetrics;
use hsm_broker_core::pool::{tcp_factory, ConnectionPool, DeviceConnection};
use hsm_broker_core::Broker;

/// HSM transaction broker client.
#[derive(Parser)]
#[command(name = "hsm-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file. Defaults to config.yaml unless --address is given.
    #[arg(short, long)]
    config: Option<String>,

    /// Override device address (host:port).
    #[arg(long)]
    address: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print metrics in Prometheus text format after the command.
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a raw command and print the response.
    Send {
        /// Command payload, without correlation id.
        payload: String,

        /// Treat the payload as hex and print responses as hex.
        #[arg(long)]
        hex: bool,

        /// Number of concurrent copies to send.
        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Verify a PIN against its PVV using the configured keys.
    VerifyPin {
        #[arg(long)]
        pan: String,

        /// Encrypted PIN block under the TPK, 16 hex characters.
        #[arg(long)]
        pin_block: String,

        #[arg(long)]
        pvv: String,
    },

    /// Report the LMK check value and firmware revision.
    Diagnostics,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %config.device.address,
        pool_capacity = config.pool.capacity,
        workers = config.broker.workers,
        request_timeout_ms = config.broker.request_timeout_ms,
        "starting hsm broker"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run(config, args.command, args.print_metrics).await })
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match (&args.config, &args.address) {
        (Some(path), _) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {path}"))?,
        (None, Some(address)) => Config::for_address(address.clone()),
        (None, None) => Config::from_file("config.yaml")
            .context("loading configuration from config.yaml")?,
    };

    // Apply CLI overrides
    if let Some(address) = &args.address {
        config.device.address.clone_from(address);
    }
    config.validate()?;
    Ok(config)
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so command output on stdout stays clean.
    if config.json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(config: Config, command: Command, print_metrics: bool) -> anyhow::Result<()> {
    let metrics = Arc::new(BrokerMetrics::new());
    let pool = Arc::new(ConnectionPool::new(
        config.pool.capacity,
        tcp_factory(config.device.address.clone(), config.device.connect_timeout()),
    ));
    let broker: Broker<DeviceConnection> = Broker::builder(pool)
        .config(&config.broker)
        .metrics(Arc::clone(&metrics))
        .span(info_span!("hsm_broker", device = %config.device.address))
        .build();

    let token = CancellationToken::new();
    let workers = {
        let broker = broker.clone();
        let token = token.clone();
        tokio::spawn(async move { broker.start(token).await })
    };

    let result = tokio::select! {
        result = execute(&broker, &config, command) => result,
        () = shutdown_signal() => {
            info!("shutdown signal received, abandoning command");
            Ok(())
        }
    };

    broker.close().await;
    token.cancel();
    if let Err(e) = workers.await {
        error!(error = %e, "broker workers failed");
    }

    if print_metrics {
        print!("{}", metrics.encode()?);
    }

    info!("hsm broker stopped");
    result
}

async fn execute(
    broker: &Broker<DeviceConnection>,
    config: &Config,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Send {
            payload,
            hex,
            count,
        } => {
            let payload = if hex {
                Bytes::from(hex::decode(payload.trim()).context("payload is not valid hex")?)
            } else {
                Bytes::from(payload)
            };

            let sends = (0..count.max(1)).map(|_| broker.send(payload.clone()));
            let mut failures = 0usize;
            for (i, result) in join_all(sends).await.into_iter().enumerate() {
                match result {
                    Ok(response) if hex => println!("{i}: {}", hex::encode_upper(&response)),
                    Ok(response) => println!("{i}: {}", String::from_utf8_lossy(&response)),
                    Err(e) => {
                        failures += 1;
                        warn!(request = i, error = %e, "request failed");
                        println!("{i}: error: {e}");
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} of {} requests failed", count.max(1));
            }
        }

        Command::VerifyPin {
            pan,
            pin_block,
            pvv,
        } => {
            let Some(keys) = &config.keys else {
                bail!("verify-pin needs a `keys` section in the configuration");
            };
            let service = PinService::new(broker.clone(), PinKeys::new(keys.tpk(), keys.pvk()));
            let request = PinVerification::new(pan, pin_block, pvv)?;

            match service.verify(&request).await {
                Ok(()) => println!("PIN verified"),
                Err(e) => {
                    if e.is_pin_verification_failure() {
                        println!("PIN verification failed");
                    }
                    return Err(e.into());
                }
            }
        }

        Command::Diagnostics => {
            let body = diagnostics(broker).await?;
            println!("{}", String::from_utf8_lossy(&body));
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
