#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

/*
 * RINEX2MQTT streams Observation RINEX as TEC measurements over MQTT.
 * Authors: Guillaume W. Bres <guillaume.bressaix@gmail.com> et al,
 * (cf. https://github.com/nav-solutions/rinex/graphs/contributors)
 * This framework is shipped under Mozilla Public V2 license.
 */

use env_logger::{Builder, Target};

use log::{error, info};

use tokio::{
    signal,
    sync::{oneshot, watch},
};

mod bus;
mod cli;
mod daemon;
mod error;
mod record;
mod runtime;
mod settings;
mod source;
mod validator;

use crate::{
    bus::{Bus, MemoryBroker, MqttBus, topic},
    cli::{Cli, Mode},
    daemon::{ReceiverDaemon, discover_receivers},
    runtime::Runtime,
    settings::Settings,
    source::RinexSource,
    validator::{MessageValidator, SimulatedGenerator},
};

/// Validates `receiver` stream over `bus`,
/// possibly feeding it with simulated measurements.
async fn validate<B: Bus + 'static>(
    bus: B,
    receiver: &str,
    settings: &Settings,
    runtime: Runtime,
    simulate: bool,
    shutdown: watch::Receiver<bool>,
) {
    let validator = MessageValidator::new(settings.freshness_window());

    let gate = if simulate {
        let (gate_tx, gate_rx) = oneshot::channel();

        let generator = SimulatedGenerator::new(receiver, bus.publisher(), runtime, settings);

        tokio::spawn(generator.run(gate_rx, shutdown.clone()));
        Some(gate_tx)
    } else {
        None
    };

    let _ = validator
        .run(bus, topic(receiver), runtime, gate, shutdown)
        .await;
}

#[tokio::main]
pub async fn main() {
    let mut builder = Builder::from_default_env();

    builder
        .target(Target::Stdout)
        .format_timestamp_secs()
        .format_module_path(false)
        .init();

    // cli
    let cli = Cli::new();

    let settings = cli.settings().unwrap_or_else(|e| {
        error!("invalid configuration: {}", e);
        std::process::exit(1);
    });

    let runtime =
        Runtime::new().unwrap_or_else(|e| panic!("Failed to determine system time: {}", e));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(_) => {
                info!("{} - interrupted: shutting down", runtime.utc_seconds());
                let _ = shutdown_tx.send(true);
            },
            Err(e) => {
                error!("signal handling error: {}", e);
                // keep the channel alive, only Ctrl+C may stop us
                std::future::pending::<()>().await;
            },
        }
    });

    match cli.mode() {
        Mode::List => match discover_receivers(&settings.data_root) {
            Ok(receivers) => {
                for receiver in receivers {
                    println!("{}", receiver);
                }
            },
            Err(e) => {
                error!("{}: {}", settings.data_root.display(), e);
                std::process::exit(1);
            },
        },
        Mode::Daemon { receiver } => {
            let client_id = settings.client_id.clone().unwrap_or(receiver.clone());

            info!(
                "{} - deploying {} (broker {}:{})",
                runtime.utc_seconds(),
                receiver,
                settings.broker,
                settings.port
            );

            let bus = MqttBus::connect(&settings, &client_id);
            let daemon = ReceiverDaemon::new(&receiver, &settings, bus, RinexSource, runtime);

            daemon.run(shutdown_rx).await;
        },
        Mode::Validate {
            receiver,
            simulate,
            loopback,
        } => {
            if loopback {
                info!("{} - loopback validation of {}", runtime.utc_seconds(), receiver);

                let broker = MemoryBroker::new();
                validate(
                    broker.connect(),
                    &receiver,
                    &settings,
                    runtime,
                    simulate,
                    shutdown_rx,
                )
                .await;
            } else {
                let client_id = settings
                    .client_id
                    .clone()
                    .unwrap_or(format!("{}-validator", receiver));

                let bus = MqttBus::connect(&settings, &client_id);
                validate(bus, &receiver, &settings, runtime, simulate, shutdown_rx).await;
            }
        },
    }
}
