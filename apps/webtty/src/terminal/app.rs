use crate::client::{AnswerDelivery, ClientSession};
use crate::host::{AnswerSource, HostConfig, HostSession, default_command};
use crate::relay::RelayTransport;
use crate::session::{Session, SessionConfig, SessionError};
use crate::signaling;
use crate::terminal::cli::{Cli, Command, HostArgs, JoinArgs};
use crate::terminal::error::CliError;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = SessionConfig {
        stun_servers: vec![cli.stun_server],
    };

    match cli.command {
        Command::Host(args) => host(&config, args).await,
        Command::Join(args) => join(&config, args).await,
    }
}

async fn host(config: &SessionConfig, args: HostArgs) -> Result<(), CliError> {
    let command = if args.command.is_empty() {
        default_command()
    } else {
        args.command
    };
    let relay = if args.one_way {
        Some(RelayTransport::http(&args.relay.relay_url).map_err(SessionError::from)?)
    } else {
        None
    };

    let session = Arc::new(Session::init(config).await?);
    let host = HostSession::new(
        session,
        HostConfig {
            command,
            one_way: args.one_way,
            non_interactive: args.non_interactive,
            relay,
            relay_timeout: Duration::from_secs(args.relay_timeout),
        },
    );

    eprintln!("Setting up a WebTTY connection.\n");
    if args.one_way {
        eprintln!(
            "Warning: one-way connections pass the answer through a third-party relay ({}).\n",
            args.relay.relay_url
        );
    }

    let token = host.create_offer().await?;
    eprintln!("Connection ready. Here is your connection data:\n");
    println!("{token}\n");
    if let Some(path) = args.offer_file.as_deref() {
        write_token(path, &token)?;
        eprintln!("Offer also written to {}.\n", path.display());
    }
    eprintln!("Paste it in the terminal after the `webtty join` command.\n");

    let source = match args.answer {
        Some(answer) => AnswerSource::Token(answer),
        None if args.one_way => AnswerSource::Relay,
        None => {
            eprintln!("When you have the answer, paste it below and hit enter:");
            AnswerSource::Prompt
        }
    };
    host.await_answer(source).await?;
    eprintln!("Answer received, connecting...");

    host.connect().await?;
    Ok(())
}

async fn join(config: &SessionConfig, args: JoinArgs) -> Result<(), CliError> {
    let input = match args.offer {
        Some(offer) => offer,
        None if args.offer_file.is_file() => args.offer_file.to_string_lossy().into_owned(),
        None => {
            return Err(CliError::InvalidArgument(format!(
                "no offer given and {} does not exist",
                args.offer_file.display()
            )));
        }
    };
    let offer = signaling::resolve_token(&input)?;
    if offer.is_empty() {
        return Err(CliError::InvalidArgument("offer is empty".into()));
    }
    debug!(target = "webtty::terminal", offer_len = offer.len(), "offer resolved");

    let relay = RelayTransport::http(&args.relay.relay_url).map_err(SessionError::from)?;
    let session = Arc::new(Session::init(config).await?);
    let client = ClientSession::new(session, offer, Some(relay));

    let answer = client.create_answer().await?;
    if let Some(path) = args.answer_file.as_deref() {
        write_token(path, &answer)?;
    }
    match client.deliver_answer(&answer).await? {
        AnswerDelivery::Relayed => {
            eprintln!("Answer sent through the relay, waiting for the host to connect...");
        }
        AnswerDelivery::Manual => {
            eprintln!("Answer created. Send the text below to the host:\n");
            println!("{answer}\n");
        }
    }

    client.run().await?;
    Ok(())
}

fn write_token(path: &Path, token: &str) -> Result<(), CliError> {
    fs::write(path, format!("{token}\n"))?;
    debug!(target = "webtty::terminal", path = %path.display(), "token written");
    Ok(())
}
