use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

use crate::host::DEFAULT_RELAY_TIMEOUT;
use crate::relay::DEFAULT_RELAY_URL;
use crate::telemetry::logging::{LogConfig, LogLevel};
use crate::terminal::error::CliError;
use crate::transport::webrtc::DEFAULT_STUN_SERVER;

/// Flag that hands the rest of the command line to the hosted program.
pub const CMD_FLAG: &str = "--cmd";
pub const DEFAULT_OFFER_FILE: &str = "webtty.offer";

#[derive(Parser, Debug)]
#[command(
    name = "webtty",
    about = "Share a terminal session over a peer-to-peer WebRTC data channel",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long = "stun-server",
        short = 's',
        global = true,
        env = "WEBTTY_STUN_SERVER",
        default_value = DEFAULT_STUN_SERVER,
        value_name = "URL",
        help = "STUN server used to discover public addresses"
    )]
    pub stun_server: String,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "WEBTTY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (off, error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "WEBTTY_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish an offer and share a command with whoever answers it
    Host(HostArgs),
    /// Answer an offer and attach this terminal to the remote command
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    #[arg(
        long = "relay-url",
        env = "WEBTTY_RELAY_URL",
        default_value = DEFAULT_RELAY_URL,
        value_name = "URL",
        help = "Base URL of the relay used by one-way connections"
    )]
    pub relay_url: String,
}

#[derive(Args, Debug)]
pub struct HostArgs {
    #[arg(
        long = "one-way",
        short = 'o',
        action = clap::ArgAction::SetTrue,
        help = "Receive the answer through the relay instead of pasting it back"
    )]
    pub one_way: bool,

    #[arg(
        long = "non-interactive",
        short = 'n',
        action = clap::ArgAction::SetTrue,
        help = "Do not mirror the session in this terminal"
    )]
    pub non_interactive: bool,

    /// A bare `--offer-file` writes to the file `join` reads by default.
    #[arg(
        long = "offer-file",
        value_name = "PATH",
        num_args = 0..=1,
        default_missing_value = DEFAULT_OFFER_FILE,
        help = "Also write the offer token to this file"
    )]
    pub offer_file: Option<PathBuf>,

    #[command(flatten)]
    pub relay: RelayArgs,

    #[arg(
        long = "relay-timeout",
        env = "WEBTTY_RELAY_TIMEOUT",
        default_value_t = DEFAULT_RELAY_TIMEOUT.as_secs(),
        value_name = "SECONDS",
        help = "How long a one-way host waits for the answer"
    )]
    pub relay_timeout: u64,

    #[arg(
        value_name = "ANSWER",
        help = "Answer token, or a file whose last line is the token"
    )]
    pub answer: Option<String>,

    /// Filled from everything after `--cmd`.
    #[arg(skip)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    #[arg(
        value_name = "OFFER",
        help = "Offer token, or a file whose last line is the token"
    )]
    pub offer: Option<String>,

    #[arg(
        long = "offer-file",
        default_value = DEFAULT_OFFER_FILE,
        value_name = "PATH",
        help = "File to read the offer from when no OFFER is given"
    )]
    pub offer_file: PathBuf,

    #[arg(
        long = "answer-file",
        value_name = "PATH",
        help = "Also write the answer token to this file"
    )]
    pub answer_file: Option<PathBuf>,

    #[command(flatten)]
    pub relay: RelayArgs,
}

/// Parses the command line. Everything after `--cmd` is the hosted program
/// and its arguments, kept verbatim.
pub fn parse_from<I, T>(args: I) -> Result<Cli, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let (head, trailing) = split_trailing_command(args)?;
    let mut cli = Cli::try_parse_from(head)?;
    match (&mut cli.command, trailing) {
        (Command::Host(host), Some(command)) => host.command = command,
        (Command::Join(_), Some(_)) => {
            return Err(CliError::InvalidArgument(format!(
                "{CMD_FLAG} is only valid when hosting"
            )));
        }
        (_, None) => {}
    }
    Ok(cli)
}

fn split_trailing_command(
    mut args: Vec<OsString>,
) -> Result<(Vec<OsString>, Option<Vec<String>>), CliError> {
    let Some(position) = args.iter().position(|arg| arg == CMD_FLAG) else {
        return Ok((args, None));
    };
    let trailing = args.split_off(position + 1);
    args.pop();
    if trailing.is_empty() {
        return Err(CliError::MissingCommand);
    }
    let command = trailing
        .into_iter()
        .map(|arg| {
            arg.into_string().map_err(|arg| {
                CliError::InvalidArgument(format!("command argument is not UTF-8: {arg:?}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((args, Some(command)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(cli: Cli) -> HostArgs {
        match cli.command {
            Command::Host(args) => args,
            Command::Join(_) => panic!("expected host"),
        }
    }

    #[test]
    fn cmd_consumes_the_rest_of_the_line() {
        let cli = parse_from([
            "webtty", "host", "-o", "--cmd", "top", "-d", "1", "--one-way",
        ])
        .unwrap();
        let args = host(cli);
        assert!(args.one_way);
        assert_eq!(args.command, vec!["top", "-d", "1", "--one-way"]);
    }

    #[test]
    fn host_defaults() {
        let cli = parse_from(["webtty", "host"]).unwrap();
        assert_eq!(cli.stun_server, DEFAULT_STUN_SERVER);
        let args = host(cli);
        assert!(!args.one_way);
        assert!(!args.non_interactive);
        assert!(args.command.is_empty());
        assert!(args.answer.is_none());
        assert_eq!(args.relay_timeout, 600);
    }

    #[test]
    fn host_takes_an_answer_and_global_flags() {
        let cli = parse_from([
            "webtty",
            "host",
            "-n",
            "answer-token",
            "-s",
            "stun:127.0.0.1:3478",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.stun_server, "stun:127.0.0.1:3478");
        assert_eq!(cli.logging.level, LogLevel::Debug);
        let args = host(cli);
        assert!(args.non_interactive);
        assert_eq!(args.answer.as_deref(), Some("answer-token"));
    }

    #[test]
    fn bare_offer_file_matches_the_join_default() {
        let args = host(parse_from(["webtty", "host", "--offer-file"]).unwrap());
        assert_eq!(args.offer_file, Some(PathBuf::from(DEFAULT_OFFER_FILE)));

        let args = host(parse_from(["webtty", "host", "--offer-file", "shared.offer"]).unwrap());
        assert_eq!(args.offer_file, Some(PathBuf::from("shared.offer")));

        let args = host(parse_from(["webtty", "host"]).unwrap());
        assert!(args.offer_file.is_none());
    }

    #[test]
    fn join_reads_the_default_offer_file() {
        let cli = parse_from(["webtty", "join"]).unwrap();
        let Command::Join(args) = cli.command else {
            panic!("expected join");
        };
        assert!(args.offer.is_none());
        assert_eq!(args.offer_file, PathBuf::from(DEFAULT_OFFER_FILE));
        assert_eq!(args.relay.relay_url, DEFAULT_RELAY_URL);
    }

    #[test]
    fn cmd_is_rejected_for_join() {
        assert!(matches!(
            parse_from(["webtty", "join", "--cmd", "sh"]).unwrap_err(),
            CliError::InvalidArgument(_)
        ));
    }

    #[test]
    fn bare_cmd_is_rejected() {
        assert!(matches!(
            parse_from(["webtty", "host", "--cmd"]).unwrap_err(),
            CliError::MissingCommand
        ));
    }

    #[test]
    fn unknown_flags_are_usage_errors() {
        let err = parse_from(["webtty", "host", "--bogus"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
