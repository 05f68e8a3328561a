//! Entry point for the Capsule guest agent.

#[cfg(not(target_os = "linux"))]
compile_error!("Capsule guest is Linux-only; build with a Linux target");

use capsule_guest::{AgentOptions, GuestResult, GuestServer};
use capsule_shared::SocketType;
use clap::Parser;
use tracing::info;

/// Capsule Guest Agent - runs inside the VM and executes container processes
#[derive(Parser, Debug)]
#[command(author, version, about = "Capsule Guest Agent - VM-side agent")]
struct GuestArgs {
    /// Listen address for host communication
    ///
    /// Examples:
    ///   --listen vsock://2695
    ///   --listen unix:///run/capsule/agent.sock
    #[arg(short, long)]
    listen: SocketType,

    /// Address to connect to once the agent is ready to serve
    ///
    /// Examples:
    ///   --notify vsock://2:2696
    ///   --notify unix:///run/capsule/ready.sock
    #[arg(short, long)]
    notify: Option<SocketType>,

    /// Keep processes in the guest's UTS namespace instead of giving each
    /// container its own hostname
    #[arg(long)]
    shared_hostname: bool,
}

#[tokio::main]
async fn main() -> GuestResult<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("[PANIC] Guest agent panicked: {}", panic_info);
        std::process::exit(1);
    }));

    // Respects RUST_LOG; defaults to "info".
    if let Err(e) = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
    {
        eprintln!("[ERROR] Failed to initialize tracing: {}", e);
    }

    let args = GuestArgs::parse();
    info!(listen = %args.listen, notify = ?args.notify, "Capsule guest agent starting");

    let options = AgentOptions {
        isolate_hostname: !args.shared_hostname,
        ..AgentOptions::default()
    };
    GuestServer::new(options).run(args.listen, args.notify).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_socket_uris() {
        let args = GuestArgs::try_parse_from([
            "capsule-guest",
            "--listen",
            "vsock://2695",
            "--notify",
            "vsock://2:2696",
        ])
        .unwrap();
        assert_eq!(args.listen, SocketType::vsock(capsule_shared::socket::CID_ANY, 2695));
        assert_eq!(args.notify, Some(SocketType::vsock(2, 2696)));
        assert!(!args.shared_hostname);
    }

    #[test]
    fn test_args_shared_hostname() {
        let args =
            GuestArgs::try_parse_from(["capsule-guest", "--listen", "vsock://2695", "--shared-hostname"])
                .unwrap();
        assert!(args.shared_hostname);
    }

    #[test]
    fn test_args_reject_unknown_scheme() {
        assert!(GuestArgs::try_parse_from(["capsule-guest", "--listen", "tcp://127.0.0.1:1"]).is_err());
    }
}
