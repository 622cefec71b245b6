use clap::Parser;
use protocol::xor;
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Sends XOR-obfuscated RCON commands through the proxy and prints replies.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Proxy address to connect to
    #[arg(short, long, default_value = "127.0.0.1:7779")]
    proxy: String,

    /// Length of the random XOR key
    #[arg(short, long, default_value = "4")]
    key_len: usize,

    /// Seconds to wait for each reply
    #[arg(short, long, default_value = "2")]
    wait: u64,

    /// Commands to send, e.g. "login password" "get players"
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut stream = TcpStream::connect(&args.proxy).await?;
    println!("Connected to {} from {}", args.proxy, stream.local_addr()?);

    // Key exchange
    let mut rng = rand::thread_rng();
    let key: Vec<u8> = (0..args.key_len.max(1)).map(|_| rng.gen()).collect();
    println!("Sending key {:02x?}", key);
    stream.write_all(&key).await?;

    // Keep the key and the first command in separate reads on the far side
    sleep(Duration::from_millis(50)).await;

    let mut buf = vec![0u8; 64 * 1024];

    for command in &args.commands {
        println!("> {}", command);
        stream.write_all(&xor(command.as_bytes(), &key)).await?;

        match timeout(Duration::from_secs(args.wait), stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                println!("Connection closed by proxy");
                return Ok(());
            }
            Ok(Ok(n)) => {
                let reply = xor(&buf[..n], &key);
                println!("< {}", String::from_utf8_lossy(&reply));
            }
            Ok(Err(e)) => {
                println!("Error receiving reply: {}", e);
                return Ok(());
            }
            Err(_) => println!("< (no reply within {}s)", args.wait),
        }
    }

    println!("Test client finished");
    Ok(())
}
