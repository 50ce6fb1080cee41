use std::io::Write;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_client_core::{Config, Connection, WsError};

/// interactive echo client: type a line, see what comes back
#[derive(Parser)]
struct Args {
    uri: String,
    #[clap(long, default_value_t = 5000)]
    handshake_timeout_ms: u64,
    #[clap(long, default_value_t = 5000)]
    recv_timeout_ms: u64,
}

fn main() {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");

    let args = Args::parse();
    let config = Config {
        handshake_timeout_ms: args.handshake_timeout_ms,
        ..Config::default()
    };

    let mut conn = Connection::connect(&args.uri, config).expect("connect failed");

    let mut input = String::new();
    loop {
        print!("[SEND] > ");
        std::io::stdout().flush().unwrap();
        input.clear();
        if std::io::stdin().read_line(&mut input).unwrap() == 0 {
            break;
        }
        let line = input.trim_end_matches('\n');
        if line == "quit" {
            break;
        }
        if let Err(e) = conn.send_text(line) {
            eprintln!("[ERROR] send failed: {e}");
            break;
        }

        loop {
            match conn.recv(args.recv_timeout_ms) {
                Ok(msg) => {
                    let text = String::from_utf8_lossy(&msg.payload);
                    println!("[RECV] > {}", text.trim());
                    conn.release_payload().unwrap();
                    break;
                }
                Err(WsError::NotReady) => continue,
                Err(WsError::Closed) => {
                    println!("[CLOSED] peer closed the connection");
                    return;
                }
                Err(e) => {
                    eprintln!("[ERROR] recv failed: {e}");
                    return;
                }
            }
        }
    }
    let _ = conn.close(1000, "");
}
