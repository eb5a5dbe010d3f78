//! `brctl`: a thin CLI frontend over the control-plane IPC (§4.P). Every
//! subcommand issues one request (or opens one stream) against the
//! running `brrelayd` and prints the response as pretty JSON.

use anyhow::{anyhow, Result};
use brcore::ipc::{IpcRequest, IpcResponse, StreamEvent};
use brcore::ipc_client::{send_request, stream_request};
use brcore::paths::control_socket_path;
use brcore::secure_storage::get_ipc_secret;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "brctl")]
#[command(about = "control-plane CLI for brrelayd", long_about = None)]
struct Cli {
    /// Local identity (hex user ID) whose IPC secret to use, for hosts
    /// running more than one identity.
    #[arg(long, global = true)]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the daemon's version and runtime info.
    Version,

    #[command(subcommand)]
    Pm(PmCommands),

    #[command(subcommand)]
    Gcm(GcmCommands),

    #[command(subcommand)]
    Kx(KxCommands),

    #[command(subcommand)]
    Posts(PostsCommands),

    /// Tip a user in DCR.
    Tip {
        user: String,
        #[arg(long)]
        dcr_amount: f64,
    },
}

#[derive(Subcommand)]
enum PmCommands {
    /// Send a private message.
    Send { user: String, msg: String },
    /// Stream inbound private messages, replaying anything unacked since
    /// `since`.
    Stream {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[derive(Subcommand)]
enum GcmCommands {
    /// Send a group-chat message.
    Send { gc_id: String, msg: String },
    /// Stream inbound group-chat messages.
    Stream {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[derive(Subcommand)]
enum KxCommands {
    /// Ask a mediator to introduce us to `target`.
    Mediate { mediator: String, target: String },
    /// Stream completed key exchanges.
    Stream {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[derive(Subcommand)]
enum PostsCommands {
    /// Subscribe to a user's posts.
    Subscribe { user: String },
    /// Unsubscribe from a user's posts.
    Unsubscribe { user: String },
    /// Stream subscribed posts.
    Stream {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let secret = get_ipc_secret(&cli.user)?;
    let socket_path = control_socket_path()?;

    match cli.command {
        Commands::Version => {
            let resp = send_request(socket_path, &secret, IpcRequest::Version).await?;
            print_response(&resp)?;
        }

        Commands::Pm(PmCommands::Send { user, msg }) => {
            let resp = send_request(socket_path, &secret, IpcRequest::Pm { user, msg }).await?;
            print_response(&resp)?;
        }
        Commands::Pm(PmCommands::Stream { since }) => {
            stream_and_print(socket_path, &secret, IpcRequest::PmStream { unacked_from: since })
                .await?;
        }

        Commands::Gcm(GcmCommands::Send { gc_id, msg }) => {
            let resp = send_request(socket_path, &secret, IpcRequest::Gcm { gc_id, msg }).await?;
            print_response(&resp)?;
        }
        Commands::Gcm(GcmCommands::Stream { since }) => {
            stream_and_print(socket_path, &secret, IpcRequest::GcmStream { unacked_from: since })
                .await?;
        }

        Commands::Kx(KxCommands::Mediate { mediator, target }) => {
            let resp = send_request(
                socket_path,
                &secret,
                IpcRequest::MediateKx { mediator, target },
            )
            .await?;
            print_response(&resp)?;
        }
        Commands::Kx(KxCommands::Stream { since }) => {
            stream_and_print(socket_path, &secret, IpcRequest::KxStream { unacked_from: since })
                .await?;
        }

        Commands::Posts(PostsCommands::Subscribe { user }) => {
            let resp =
                send_request(socket_path, &secret, IpcRequest::SubscribeToPosts { user }).await?;
            print_response(&resp)?;
        }
        Commands::Posts(PostsCommands::Unsubscribe { user }) => {
            let resp = send_request(
                socket_path,
                &secret,
                IpcRequest::UnsubscribeToPosts { user },
            )
            .await?;
            print_response(&resp)?;
        }
        Commands::Posts(PostsCommands::Stream { since }) => {
            stream_and_print(
                socket_path,
                &secret,
                IpcRequest::PostsStream { unacked_from: since },
            )
            .await?;
        }

        Commands::Tip { user, dcr_amount } => {
            let resp =
                send_request(socket_path, &secret, IpcRequest::TipUser { user, dcr_amount })
                    .await?;
            print_response(&resp)?;
        }
    }

    Ok(())
}

fn print_response(resp: &IpcResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(resp)?);
    if let IpcResponse::Error { kind, message } = resp {
        return Err(anyhow!("{kind}: {message}"));
    }
    Ok(())
}

async fn stream_and_print(
    socket_path: std::path::PathBuf,
    secret: &[u8],
    request: IpcRequest,
) -> Result<()> {
    stream_request(socket_path, secret, request, |event: StreamEvent| {
        if let Ok(text) = serde_json::to_string(&event) {
            println!("{text}");
        }
        true
    })
    .await
}
