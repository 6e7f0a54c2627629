use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use client::endpoint::ClientEndpoint;
use client::session::SessionClient;
use shared::transport::udp::UdpTransport;
use shared::transport::Transport;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server address to connect to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to connect to
        #[clap(short, long, default_value = "8888")]
        port: u16,
        /// User id to log in as
        #[clap(short, long)]
        user_id: String,
        /// Tick rate (updates per second)
        #[clap(short, long, default_value = "30")]
        tick_rate: u32,
    }

    env_logger::init();
    let args = Args::parse();

    let transport: Arc<dyn Transport> = Arc::new(UdpTransport::new());
    let endpoint = Arc::new(ClientEndpoint::new(transport));
    let session = SessionClient::new(Arc::clone(&endpoint));

    endpoint.connect(&args.host, args.port, 1)?;

    // Scripted run: log in, show the roster, log out.
    let tick = Duration::from_secs_f32(1.0 / args.tick_rate as f32);
    let mut sent_login = false;
    let mut sent_logout = false;
    let deadline = Instant::now() + Duration::from_secs(10);

    while Instant::now() < deadline {
        endpoint.listen();

        if endpoint.is_connected() && !sent_login {
            session.login(&args.user_id);
            sent_login = true;
        }

        let state = session.state();
        if state.logged_in && !state.connected_users.is_empty() && !sent_logout {
            println!("connected users: {:?}", state.connected_users);
            session.logout();
            sent_logout = true;
        }
        if sent_logout && !state.logged_in {
            println!("logged out: {}", state.last_detail);
            break;
        }

        endpoint.send_output_messages();
        std::thread::sleep(tick);
    }

    endpoint.stop();
    Ok(())
}
