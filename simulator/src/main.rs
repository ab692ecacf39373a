mod frames;

use clap::Parser;
use frames::Receiver;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Loopback stand-in for the receiver-management process: serves
/// newline-delimited JSON GNSS frames to every connected client.
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SIM_BIND", default_value = "127.0.0.1:9635")]
    bind: String,

    /// Frames per second per client
    #[arg(long, env = "SIM_RATE", default_value_t = 1.0)]
    rate: f64,

    /// Walk start latitude, degrees
    #[arg(long, env = "SIM_LATITUDE", default_value_t = 26.1445)]
    latitude: f64,

    /// Walk start longitude, degrees
    #[arg(long, env = "SIM_LONGITUDE", default_value_t = 91.7362)]
    longitude: f64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting GNSS feed simulator");
    info!(
        "Bind: {}, rate: {} frames/s, start: ({}, {})",
        args.bind, args.rate, args.latitude, args.longitude
    );

    let listener = match TcpListener::bind(&args.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", args.bind, e);
            std::process::exit(1);
        }
    };

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!("Client connected: {}", peer);
                let args = args.clone();
                tokio::spawn(async move {
                    feed_client(socket, args).await;
                    info!("Client disconnected: {}", peer);
                });
            }
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn feed_client(mut socket: TcpStream, args: Args) {
    let mut receiver = Receiver::new(args.latitude, args.longitude);
    let period = Duration::from_secs_f64(1.0 / args.rate.max(0.01));
    let mut ticker = tokio::time::interval(period);
    let mut sent = 0u64;

    loop {
        ticker.tick().await;

        let frame = {
            let mut rng = rand::thread_rng();
            receiver.next_frame(&mut rng)
        };

        if frame.is_empty() {
            continue;
        }

        if let Err(e) = socket.write_all(frame.as_bytes()).await {
            warn!("Write failed: {}", e);
            break;
        }
        if let Err(e) = socket.write_all(b"\n").await {
            warn!("Write failed: {}", e);
            break;
        }

        sent += 1;
        if sent % 600 == 0 {
            info!("Sent {} frames", sent);
        }
    }
}
