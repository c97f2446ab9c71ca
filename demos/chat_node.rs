use anyhow::anyhow;
use clap::Parser;
use clap_derive::{Parser, ValueEnum};
use rudp_session::config::SessionConfig;
use rudp_session::endpoint::{ClientEndpoint, ServerEndpoint};
use rudp_session::session::{CallbackListener, Session};
use tokio::select;
use tracing::{info, warn, Level};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Role {
    Server,
    Client,
}

#[derive(Parser)]
struct Args {
    role: Role,

    /// address to bind to (server) or to connect to (client)
    #[clap(long, default_value = "127.0.0.1")]
    address: String,

    #[clap(long, default_value_t = 2330)]
    port: u32,

    #[clap(long, default_value = "anonymous")]
    identity: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn chat_listener() -> CallbackListener {
    CallbackListener::new(
        |d| {
            info!("{:?} connected {}", d.peer, String::from_utf8_lossy(d.data));
        },
        |d| {
            info!("{:?} disconnected", d.peer);
        },
        |d| {
            info!("{:?} on channel {}: {}", d.peer, d.channel, String::from_utf8_lossy(d.data));
        },
    )
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut session = Session::new(SessionConfig::new());
    session.install_listener(Box::new(chat_listener()));

    let result = match args.role {
        Role::Server => run_server(&mut session, ServerEndpoint::new(args.address, args.port)).await,
        Role::Client => run_client(&mut session, ClientEndpoint::new(args.address, args.port, args.identity)).await,
    };

    session.shutdown();
    result
}

async fn run_server(session: &mut Session, endpoint: ServerEndpoint) -> anyhow::Result<()> {
    endpoint.connect(session).await?;
    info!("listening on {} - press Ctrl-C to stop", endpoint.ipaddress());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        select! {
            _ = &mut ctrl_c => {
                info!("shutting down");
                return Ok(());
            }
            result = endpoint.poll(session) => {
                result?;
            }
        }

        endpoint.broadcast(session, "server: hello, world")?;
    }
}

async fn run_client(session: &mut Session, endpoint: ClientEndpoint) -> anyhow::Result<()> {
    endpoint.connect(session).await?;
    info!("connecting to {} as {} - press Ctrl-C to stop", endpoint.ipaddress(), endpoint.identity());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        select! {
            _ = &mut ctrl_c => {
                info!("disconnecting");
                endpoint.disconnect(session)?;
                endpoint.poll(session).await?;
                return Ok(());
            }
            result = endpoint.poll(session) => {
                result?;
            }
        }

        if session.is_connected() {
            endpoint.send(session, "client: hello, world")?;
        }
        else if !session.is_connecting() {
            warn!("connection to {} was lost", endpoint.ipaddress());
            return Err(anyhow!("not connected"));
        }
    }
}
