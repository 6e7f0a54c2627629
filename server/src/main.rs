use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Deserialize;

use server::endpoint::{ServerConfig, ServerEndpoint};
use server::info_manager::ServerInfoManager;
use server::user_manager::UserManager;
use shared::transport::udp::UdpTransport;
use shared::transport::Transport;

/// One provisioned identity from a roster file.
#[derive(Debug, Deserialize)]
struct RosterEntry {
    user_id: String,
    user_name: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server port to listen on
        #[clap(short, long, default_value = "8888")]
        port: u16,
        /// Tick rate (updates per second)
        #[clap(short, long, default_value = "30")]
        tick_rate: u32,
        /// Maximum messages processed per tick, per direction
        #[clap(short, long, default_value = "500")]
        max_messages: u16,
        /// Dispatch worker threads
        #[clap(short, long, default_value = "1")]
        workers: usize,
        /// Comma-separated user ids to provision at startup
        #[clap(short, long, default_value = "")]
        users: String,
        /// JSON roster file with {user_id, user_name} entries
        #[clap(short, long)]
        roster: Option<String>,
    }

    env_logger::init();
    let args = Args::parse();

    // Provision the known identities before any client can log in.
    let users = Arc::new(UserManager::new());
    for user_id in args.users.split(',').filter(|id| !id.is_empty()) {
        users.create_user(user_id, &format!("{user_id}_UserName"));
    }
    if let Some(path) = &args.roster {
        let raw = std::fs::read_to_string(path)?;
        let roster: Vec<RosterEntry> = serde_json::from_str(&raw)?;
        for entry in roster {
            users.create_user(&entry.user_id, &entry.user_name);
        }
    }
    log::info!("provisioned {} users", users.user_count());

    let transport: Arc<dyn Transport> = Arc::new(UdpTransport::new());
    let endpoint = ServerEndpoint::new(
        transport,
        Arc::clone(&users),
        ServerConfig {
            port: args.port,
            max_messages: args.max_messages,
            workers: args.workers,
        },
    )?;

    let manager = Arc::new(ServerInfoManager::new(
        users,
        endpoint.outbound(),
        endpoint.clock(),
    ));
    manager.install(&endpoint);

    // Tick loop: receive pass, send pass, sleep out the remainder.
    let tick = Duration::from_secs_f32(1.0 / args.tick_rate as f32);
    loop {
        let started = Instant::now();
        endpoint.listen();
        endpoint.send_output_messages();
        if let Some(remaining) = tick.checked_sub(started.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
}
