use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::error::Error;
use std::process;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::signal;
use tracing::Level;
use zbus::text::{self, TextError, TextWriter};
use zbus::{Bus, BusConfig, BusError, Event, SimTransport, VERSION};

const EXIT_USAGE: i32 = 64;
const EXIT_IO: i32 = 74;

const ABOUT: &str = "\
This program provides the master side of the ZEN-bus protocol. Hardware ZEN-bus is
supported only on Linux and runs over I2C with a GPIO alert pin. For other platforms
and for testing there is a simulated bus based on a simple binary TCP protocol.

Commands are read from stdin and bus events are written to stdout.";

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let matches = match app().get_matches_safe() {
        Ok(matches) => matches,
        Err(e) if e.use_stderr() => {
            eprintln!("{}", e.message);
            process::exit(EXIT_USAGE);
        }
        // --help and --version
        Err(e) => e.exit(),
    };

    init_tracing(matches.is_present("verbose"));

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            process::exit(EXIT_USAGE);
        }
    };

    let format = match matches.value_of("format") {
        Some("json") => Format::Json,
        _ => Format::Text,
    };

    let bus = match open_bus(&matches, config).await {
        Ok(bus) => bus,
        Err(Failure::Usage(message)) => {
            eprintln!("{} {}", "error:".red().bold(), message);
            process::exit(EXIT_USAGE);
        }
        Err(Failure::Io(e)) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            process::exit(EXIT_IO);
        }
    };

    // stdin is read on a blocking thread that cannot be cancelled, so leave
    // through process::exit instead of waiting for the runtime to drain
    process::exit(serve(bus, format).await);
}

fn app() -> App<'static, 'static> {
    App::new("zbus")
        .version(VERSION)
        .about("ZEN-bus master")
        .long_about(ABOUT)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON bus configuration")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["text", "json"])
                .default_value("text")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log bus activity to stderr")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("i2c")
                .about("Hardware bus on /dev/i2c-<i2c_num> with alert on /sys/class/gpio/gpio<gpio_num>")
                .arg(
                    Arg::with_name("i2c_num")
                        .help("I2C device number (0-9)")
                        .required(true)
                        .validator(|v| match v.parse::<u32>() {
                            Ok(n) if n <= 9 => Ok(()),
                            _ => Err("invalid I2C device number".into()),
                        }),
                )
                .arg(
                    Arg::with_name("gpio_num")
                        .help("GPIO pin number (0-999)")
                        .required(true)
                        .validator(|v| match v.parse::<u32>() {
                            Ok(n) if n <= 999 => Ok(()),
                            _ => Err("invalid GPIO pin number".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("sim")
                .about("Simulated bus over TCP")
                .long_about(
                    "Simulated bus over TCP. <address> is \"host:port\"; an empty host binds all \
                     interfaces, e.g. \":7082\" or \"[::1]:7082\".",
                )
                .arg(
                    Arg::with_name("address")
                        .help("Address to listen on")
                        .required(true),
                ),
        )
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(matches: &ArgMatches<'_>) -> Result<BusConfig, BoxError> {
    match matches.value_of("config") {
        Some(path) => Ok(BusConfig::from_json_file(path)?),
        None => Ok(BusConfig::default()),
    }
}

enum Failure {
    Usage(String),
    Io(BusError),
}

impl From<BusError> for Failure {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Config(e) => Failure::Usage(e.to_string()),
            e => Failure::Io(e),
        }
    }
}

async fn open_bus(matches: &ArgMatches<'_>, config: BusConfig) -> Result<Bus, Failure> {
    match matches.subcommand() {
        ("i2c", Some(sub)) => {
            let device = parse_number(sub, "i2c_num")?;
            let pin = parse_number(sub, "gpio_num")?;
            open_i2c(device, pin, config)
        }
        ("sim", Some(sub)) => {
            let address = sub.value_of("address").unwrap_or_default();
            let address = if address.starts_with(':') {
                format!("0.0.0.0{}", address)
            } else {
                address.to_string()
            };

            let (transport, alert) = SimTransport::bind(address.as_str(), config.sim.clone()).await?;
            Ok(Bus::new(Box::new(transport), Box::new(alert), config)?)
        }
        _ => Err(Failure::Usage("missing bus type".into())),
    }
}

fn parse_number(matches: &ArgMatches<'_>, name: &str) -> Result<u32, Failure> {
    matches
        .value_of(name)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Failure::Usage(format!("invalid {}", name)))
}

#[cfg(target_os = "linux")]
fn open_i2c(device: u32, pin: u32, config: BusConfig) -> Result<Bus, Failure> {
    use zbus::alert::GpioAlert;
    use zbus::transport::{HardwareTransport, LinuxI2c};

    let adapter = LinuxI2c::open(device, config.i2c.clone())?;
    let alert = GpioAlert::open(pin)?;
    Ok(Bus::new(
        Box::new(HardwareTransport::new(adapter)),
        Box::new(alert),
        config,
    )?)
}

#[cfg(not(target_os = "linux"))]
fn open_i2c(_device: u32, _pin: u32, _config: BusConfig) -> Result<Bus, Failure> {
    Err(Failure::Io(BusError::Unsupported))
}

enum Output {
    Text(TextWriter<Stdout>),
    Json(Stdout),
}

impl Output {
    fn new(format: Format) -> Self {
        match format {
            Format::Text => Output::Text(TextWriter::new(tokio::io::stdout())),
            Format::Json => Output::Json(tokio::io::stdout()),
        }
    }

    async fn greeting(&mut self) -> Result<(), BoxError> {
        match self {
            Output::Text(writer) => writer.write_greeting(VERSION).await?,
            Output::Json(out) => {
                let line = serde_json::json!({ "type": "Greeting", "version": VERSION });
                out.write_all(format!("{}\n", line).as_bytes()).await?;
                out.flush().await?;
            }
        }
        Ok(())
    }

    async fn event(&mut self, event: &Event) -> Result<(), BoxError> {
        match self {
            Output::Text(writer) => writer.write_event(event).await?,
            Output::Json(out) => {
                let line = serde_json::to_string(event)?;
                out.write_all(line.as_bytes()).await?;
                out.write_all(b"\n").await?;
                out.flush().await?;
            }
        }
        Ok(())
    }
}

/// Bridges stdin commands and bus events until input ends, the bus dies, or
/// the user interrupts. Returns the exit code.
async fn serve(mut bus: Bus, format: Format) -> i32 {
    // commands go in on their own task so events keep draining while a
    // command waits for room in the queue
    let mut forwarder = tokio::spawn(text::forward(tokio::io::stdin(), bus.handle()));
    let mut output = Output::new(format);

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut result = output.greeting().await;
    while result.is_ok() {
        tokio::select! {
            _ = &mut ctrl_c => {
                eprintln!("{}", "terminating...".yellow());
                break;
            }
            finished = &mut forwarder => {
                result = match finished {
                    // the engine is going down; close() reports why
                    Ok(Err(TextError::Bus(BusError::Closed))) => Ok(()),
                    Ok(outcome) => outcome.map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                break;
            }
            event = bus.next_event() => match event {
                Some(event) if event.is_fatal() => break,
                Some(event) => result = output.event(&event).await,
                None => break,
            },
        }
    }

    forwarder.abort();
    let closed = bus.close().await.map_err(Into::into);

    // whatever the engine reported before it stopped
    while let Some(event) = bus.next_event().await {
        if result.is_err() {
            break;
        }
        if !event.is_fatal() {
            result = output.event(&event).await;
        }
    }

    match result.and(closed) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            EXIT_IO
        }
    }
}
