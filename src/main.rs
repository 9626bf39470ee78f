use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_derive::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{debug, info, Level};

use ipkchat::config::{ClientConfig, TransportKind};
use ipkchat::input::{parse_line, Command, HELP_TEXT};
use ipkchat::session::datagram::DatagramSession;
use ipkchat::session::output::{format_local_error, ChatOutput, ConsoleOutput};
use ipkchat::session::stream::StreamSession;
use ipkchat::session::Session;

#[derive(Copy, Clone, ValueEnum)]
enum Protocol {
    Udp,
    Tcp,
}

/// Client for the IPK24-CHAT protocol
#[derive(Parser)]
struct Args {
    /// transport protocol
    #[clap(short = 't', value_enum)]
    transport: Protocol,

    /// server host name or IP address
    #[clap(short = 's')]
    server: String,

    #[clap(short = 'p', default_value_t = 4567)]
    port: u16,

    /// UDP confirmation timeout in milliseconds
    #[clap(short = 'd', default_value_t = 250)]
    timeout: u64,

    /// maximum number of UDP retransmissions
    #[clap(short = 'r', default_value_t = 3)]
    retransmissions: u8,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::WARN,
    };

    // stdout is reserved for chat messages
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let transport = match args.transport {
        Protocol::Udp => TransportKind::Udp,
        Protocol::Tcp => TransportKind::Tcp,
    };
    let mut config = ClientConfig::new(transport, args.server);
    config.server_port = args.port;
    config.confirmation_timeout = Duration::from_millis(args.timeout);
    config.max_retransmissions = args.retransmissions;
    config.validate()?;
    let config = Arc::new(config);

    let server_addr = config.resolve_server_addr().await?;
    let output: Arc<dyn ChatOutput> = Arc::new(ConsoleOutput);

    let session: Arc<dyn Session> = match config.transport {
        TransportKind::Udp => Arc::new(DatagramSession::connect(server_addr, output, config.clone()).await?),
        TransportKind::Tcp => Arc::new(StreamSession::connect(server_addr, output, config.clone()).await?),
    };

    let mut receive_loop = tokio::spawn({
        let session = session.clone();
        async move { session.run_receive_loop().await }
    });

    let exit_code = select! {
        exit_code = &mut receive_loop => exit_code?,
        result = process_user_input(session.as_ref()) => {
            if let Err(e) = result {
                eprintln!("{}", format_local_error(&format!("Reading input failed: {}", e)));
            }
            end_session(session.as_ref()).await;
            receive_loop.await?
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            end_session(session.as_ref()).await;
            receive_loop.await?
        }
    };

    std::process::exit(exit_code);
}

async fn end_session(session: &dyn Session) {
    if let Err(e) = session.end_session().await {
        debug!("error ending session: {}", e);
    }
}

/// Executes commands read from stdin until EOF, or until the session ends
async fn process_user_input(session: &dyn Session) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", format_local_error(&e.to_string()));
                continue;
            }
        };

        let result = match command {
            Command::Auth { username, display_name, secret } => session.authenticate(&username, &display_name, &secret).await.map(|_| ()),
            Command::Join { channel_id } => session.join_channel(&channel_id).await.map(|_| ()),
            Command::Rename { display_name } => session.rename(&display_name).await,
            Command::Help => {
                println!("{}", HELP_TEXT);
                Ok(())
            }
            Command::ChatMessage(content) => session.send_chat_message(&content).await,
        };

        if let Err(e) = result {
            if e.is_fatal() {
                // the session reported it and is shutting down
                debug!("session ended: {}", e);
                return Ok(());
            }
            eprintln!("{}", format_local_error(&e.user_text()));
        }
    }

    debug!("end of input");
    Ok(())
}
