use clap::Parser;
use ws_client_core::{Config, Connection, OpCode, WsError};

/// one-shot demo: send a single binary frame, print the first reply, close
#[derive(Parser)]
struct Args {
    uri: String,
    #[clap(default_value = "ping from raw demo")]
    payload: String,
}

fn main() {
    let args = Args::parse();
    let mut conn = Connection::connect(&args.uri, Config::default()).expect("connect failed");

    conn.send_binary(args.payload.as_bytes())
        .expect("send failed");

    loop {
        match conn.recv(5000) {
            Ok(msg) => {
                match msg.opcode {
                    OpCode::Text => println!("[RECV text] {}", String::from_utf8_lossy(&msg.payload)),
                    _ => println!("[RECV {:?}] {} bytes", msg.opcode, msg.payload.len()),
                }
                conn.release_payload().unwrap();
                break;
            }
            Err(WsError::NotReady) => continue,
            Err(e) => {
                eprintln!("recv failed: {e}");
                break;
            }
        }
    }

    conn.close(1000, "").ok();
}
