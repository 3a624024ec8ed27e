//! Headless MazeWar test client.
//!
//! Connects to a server, logs in, prints every inbound frame legibly, and
//! maps stdin lines to game commands:
//!
//! ```text
//! w / s    move forward / backward
//! a / d    turn left / right
//! f        fire
//! r        refresh view
//! q        quit
//! <text>   send chat
//! ```

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use shared::{send_packet, FrameReader, Packet, PacketHeader, PacketType};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server host to connect to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[clap(short = 'p', long)]
    port: u16,

    /// Avatar letter to log in with (A-Z)
    #[clap(short = 'a', long, default_value = "A")]
    avatar: char,

    /// Display name
    #[clap(short = 'u', long, default_value = "tester")]
    username: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let stream = TcpStream::connect((args.host.as_str(), args.port)).await?;
    println!("Connected to server at {}", stream.peer_addr()?);
    let (read_half, mut writer) = stream.into_split();

    let name = args.username.as_bytes();
    let mut login = PacketHeader {
        param1: args.avatar as u8,
        size: name.len() as u16,
        ..PacketHeader::new(PacketType::Login)
    };
    send_packet(&mut writer, &mut login, Some(name)).await?;

    tokio::spawn(async move {
        let mut reader = FrameReader::new(read_half);
        loop {
            match reader.read_packet().await {
                Ok(packet) => print_packet(&packet),
                Err(err) => {
                    eprintln!("connection closed: {}", err);
                    std::process::exit(0);
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (ty, sign, payload): (PacketType, i8, Option<&[u8]>) = match line {
            "" => continue,
            "q" => break,
            "w" => (PacketType::Move, 1, None),
            "s" => (PacketType::Move, -1, None),
            "a" => (PacketType::Turn, 1, None),
            "d" => (PacketType::Turn, -1, None),
            "f" => (PacketType::Fire, 0, None),
            "r" => (PacketType::Refresh, 0, None),
            text => (PacketType::Send, 0, Some(text.as_bytes())),
        };
        let mut header = PacketHeader {
            param1: sign as u8,
            size: payload.map_or(0, |p| p.len() as u16),
            ..PacketHeader::new(ty)
        };
        send_packet(&mut writer, &mut header, payload).await?;
    }

    Ok(())
}

fn print_packet(packet: &Packet) {
    let header = &packet.header;
    match PacketType::from_byte(header.ty) {
        Some(PacketType::Ready) => println!("READY: logged in"),
        Some(PacketType::InUse) => println!("INUSE: avatar already taken"),
        Some(PacketType::Clear) => println!("CLEAR"),
        Some(PacketType::Show) => println!(
            "SHOW {:?} at x={} d={}",
            header.param1 as char, header.param2, header.param3
        ),
        Some(PacketType::Alert) => println!("ALERT: you were hit!"),
        Some(PacketType::Score) => {
            if header.param2 as i8 == -1 {
                println!("SCORE: {} left the game", header.param1 as char);
            } else {
                println!(
                    "SCORE: {} = {}",
                    header.param1 as char, header.param2 as i8
                );
            }
        }
        Some(PacketType::Chat) => println!(
            "CHAT: {}",
            String::from_utf8_lossy(packet.payload_bytes())
        ),
        other => println!("frame {:?} (byte {})", other, header.ty),
    }
}
