use clap::{App, Arg};
use colored::*;
use std::process;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, Level};
use zbus::transport::{SimSlave, SlaveFrame};
use zbus::{Udid, VERSION};

const EXIT_USAGE: i32 = 64;
const EXIT_IO: i32 = 74;

#[tokio::main]
async fn main() {
    let matches = match App::new("zbus-slave")
        .version(VERSION)
        .about("Simulated ZEN-bus slave")
        .long_about(
            "Connects to a `zbus sim` master, prints the assigned address and every packet \
             received, and sends each hex line read from stdin as one packet.",
        )
        .arg(
            Arg::with_name("address")
                .help("Master address, host:port")
                .required(true),
        )
        .arg(
            Arg::with_name("udid")
                .help("Device UDID, 16 hex digits")
                .required(true)
                .validator(|v| v.parse::<Udid>().map(|_| ()).map_err(|e| e.to_string())),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log connection activity to stderr"),
        )
        .get_matches_safe()
    {
        Ok(matches) => matches,
        Err(e) if e.use_stderr() => {
            eprintln!("{}", e.message);
            process::exit(EXIT_USAGE);
        }
        Err(e) => e.exit(),
    };

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let address = matches.value_of("address").unwrap_or_default();
    let udid = match matches.value_of("udid").map(str::parse::<Udid>) {
        Some(Ok(udid)) => udid,
        _ => {
            eprintln!("{} invalid UDID", "error:".red().bold());
            process::exit(EXIT_USAGE);
        }
    };

    let slave = match SimSlave::connect(address, udid).await {
        Ok(slave) => slave,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            process::exit(EXIT_IO);
        }
    };
    println!("ADDR {:02X}", slave.address());

    process::exit(run(slave).await);
}

async fn run(slave: SimSlave) -> i32 {
    let (mut receiver, mut sender) = slave.into_split();

    let incoming = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(Some(SlaveFrame::Packet(data))) => println!("PKT {}", hex(&data)),
                Ok(Some(SlaveFrame::Assigned(addr))) => println!("ADDR {:02X}", addr),
                Ok(Some(SlaveFrame::Quit)) => {
                    println!("QUIT");
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    });
    tokio::pin!(incoming);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => return 0,
            finished = &mut incoming => {
                return match finished {
                    Ok(Ok(())) => 0,
                    Ok(Err(e)) => {
                        eprintln!("{} {}", "error:".red().bold(), e);
                        EXIT_IO
                    }
                    Err(_) => EXIT_IO,
                };
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let Some(data) = unhex(line) else {
                        eprintln!("{} not a hex string: {}", "warning:".yellow(), line);
                        continue;
                    };
                    if let Err(e) = sender.send(&data).await {
                        eprintln!("{} {}", "error:".red().bold(), e);
                        return EXIT_IO;
                    }
                    debug!(len = data.len(), "packet sent");
                }
                Ok(None) => {
                    let _ = sender.shutdown().await;
                    return 0;
                }
                Err(e) => {
                    eprintln!("{} {}", "error:".red().bold(), e);
                    return EXIT_IO;
                }
            },
        }
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

fn unhex(text: &str) -> Option<Vec<u8>> {
    let text: String = text.split_whitespace().collect();
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
