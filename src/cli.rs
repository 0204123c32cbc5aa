use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, ColorChoice, Command, value_parser};

use crate::{error::Error, settings::Settings};

/// Operating mode, selected by sub command
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    /// Stream the observation files of this receiver
    Daemon { receiver: String },

    /// Validate the stream of this receiver, possibly simulating it
    Validate {
        receiver: String,
        simulate: bool,
        loopback: bool,
    },

    /// List available receivers
    List,
}

pub struct Cli {
    /// Arguments passed by user
    matches: ArgMatches,
}

fn receiver_arg() -> Arg {
    Arg::new("receiver")
        .value_name("RECEIVER")
        .required(true)
        .help("Receiver name. Defines both the data directory and the gnss/data/<RECEIVER> topic.")
}

fn command() -> Command {
    Command::new("rinex2mqtt")
        .author("Guillaume W. Bres, <guillaume.bressaix@gmail.com>")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Observation RINEX to MQTT TEC streamer, and stream validator")
        .color(ColorChoice::Always)
        .arg_required_else_help(true)
        .subcommand_required(true)
        .next_help_heading("Configuration")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Load settings from JSON file. Command line options prevail."),
        )
        .arg(
            Arg::new("broker")
                .short('b')
                .long("broker")
                .value_name("HOST")
                .global(true)
                .help("MQTT broker. Default is \"broker.emqx.io\""),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .global(true)
                .value_parser(value_parser!(u16))
                .help("MQTT broker port. Default is 1883"),
        )
        .arg(
            Arg::new("client-id")
                .long("client-id")
                .value_name("ID")
                .global(true)
                .help("Custom MQTT client ID. Must be unique on the broker."),
        )
        .arg(
            Arg::new("no-reconnect")
                .long("no-reconnect")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Do not try to reconnect once the broker connection is lost"),
        )
        .next_help_heading("Streaming")
        .arg(
            Arg::new("data-root")
                .short('d')
                .long("data-root")
                .value_name("DIR")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Root of the <RECEIVER>/<RECEIVER>_R_*.rnx tree. Default is \"rnx_files\""),
        )
        .arg(
            Arg::new("pacing")
                .long("pacing")
                .value_name("SECONDS")
                .global(true)
                .value_parser(value_parser!(f64))
                .help("Delay between two publications. Default is 30s"),
        )
        .arg(
            Arg::new("poll")
                .long("poll")
                .value_name("SECONDS")
                .global(true)
                .value_parser(value_parser!(f64))
                .help("Data directory polling period. Default is 60s"),
        )
        .next_help_heading("Validation")
        .arg(
            Arg::new("window")
                .short('w')
                .long("window")
                .value_name("SECONDS")
                .global(true)
                .value_parser(value_parser!(f64))
                .help("Freshness window: older (or newer) messages are rejected. Default is 30s"),
        )
        .subcommand(
            Command::new("daemon")
                .about("Stream the latest observation file of this receiver")
                .arg(receiver_arg()),
        )
        .subcommand(
            Command::new("validate")
                .about("Subscribe to this receiver and validate its messages")
                .arg(receiver_arg())
                .arg(
                    Arg::new("simulate")
                        .short('s')
                        .long("simulate")
                        .action(ArgAction::SetTrue)
                        .help("Publish simulated measurements on the receiver topic"),
                )
                .arg(
                    Arg::new("loopback")
                        .long("loopback")
                        .action(ArgAction::SetTrue)
                        .requires("simulate")
                        .help("Use an in-process broker instead of MQTT"),
                ),
        )
        .subcommand(Command::new("list").about("List receivers available in data root"))
}

impl Cli {
    /// Build new command line interface
    pub fn new() -> Self {
        Self {
            matches: command().get_matches(),
        }
    }

    #[cfg(test)]
    fn from_args(args: &[&str]) -> Self {
        Self {
            matches: command().get_matches_from(args),
        }
    }

    /// Selected [Mode]
    pub fn mode(&self) -> Mode {
        match self.matches.subcommand() {
            Some(("daemon", sub)) => Mode::Daemon {
                receiver: Self::receiver(sub),
            },
            Some(("validate", sub)) => Mode::Validate {
                receiver: Self::receiver(sub),
                simulate: sub.get_flag("simulate"),
                loopback: sub.get_flag("loopback"),
            },
            _ => Mode::List,
        }
    }

    fn receiver(sub: &ArgMatches) -> String {
        sub.get_one::<String>("receiver")
            .cloned()
            .unwrap_or_default()
    }

    /// Global options may be passed before or after the sub command
    fn matches(&self) -> &ArgMatches {
        match self.matches.subcommand() {
            Some((_, sub)) => sub,
            None => &self.matches,
        }
    }

    /// Builds [Settings]: defaults, then config file, then command line
    pub fn settings(&self) -> Result<Settings, Error> {
        let matches = self.matches();

        let mut settings = match matches.get_one::<PathBuf>("config") {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };

        if let Some(broker) = matches.get_one::<String>("broker") {
            settings.broker = broker.clone();
        }

        if let Some(port) = matches.get_one::<u16>("port") {
            settings.port = *port;
        }

        if let Some(client_id) = matches.get_one::<String>("client-id") {
            settings.client_id = Some(client_id.clone());
        }

        if matches.get_flag("no-reconnect") {
            settings.reconnect.enabled = false;
        }

        if let Some(root) = matches.get_one::<PathBuf>("data-root") {
            settings.data_root = root.clone();
        }

        if let Some(pacing) = matches.get_one::<f64>("pacing") {
            settings.pacing_secs = *pacing;
        }

        if let Some(poll) = matches.get_one::<f64>("poll") {
            settings.poll_interval_secs = *poll;
        }

        if let Some(window) = matches.get_one::<f64>("window") {
            settings.freshness_window_secs = *window;
        }

        settings.validate()?;
        Ok(settings)
    }
}
