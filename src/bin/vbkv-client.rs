//! The vbkv-client executable supports the following command line arguments:
//!
//! `vbkv-client set <KEY> <VALUE> [--flags N] [--expiration SECS]`
//!
//!     Set the value of a key.
//!
//! `vbkv-client get <KEY>...`
//!
//!     Get the values of one or more keys, one per line. A missing key prints "Key not found".
//!
//! `vbkv-client incr <KEY> [--delta N] [--initial N]` and `vbkv-client decr <KEY> [--delta N] [--initial N]`
//!
//!     Add to / subtract from a counter and print its new value.
//!
//! Every command accepts the cluster options `--host`, `--port`, `--pool`, `--bucket`,
//! `--username` and `--password`, or `--config FILE` to load them from a JSON file (flags given
//! on the command line win). `--timeout SECS` bounds how long to wait for the results
//! (default 10), `--verbose` turns on debug logging.
//!
//! Print an error and return a non-zero exit code if an operation fails or times out.
//!
//! `vbkv-client -V`
//!
//!     Print the version.

use std::fs::File;
use std::time::{Duration, Instant};

use clap::{crate_version, App, Arg, ArgMatches, SubCommand};
use crossbeam::channel;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use vbkv::{
    ArithmeticOptions, Client, ConnectOptions, ErrorKind, OperationResult, Result, SetOptions, VbkvError,
};

const DEFAULT_TIMEOUT_SECS: &str = "10";

/// what to do once connected
#[derive(Debug)]
enum Action {
    Set { key: String, value: String, options: SetOptions },
    Get { keys: Vec<String> },
    Incr { key: String, options: ArithmeticOptions },
    Decr { key: String, options: ArithmeticOptions },
}

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    options: ConnectOptions,
    timeout: Duration,
    action: Action,
}

fn main() -> Result<()> {
    let matches = App::new("vbkv-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("a vbucket-aware key-value store client")
        .subcommands(vec![
            SubCommand::with_name("set")
                .about("Set the value of a key")
                .arg(Arg::with_name("KEY").required(true).index(1))
                .arg(Arg::with_name("VALUE").required(true).index(2))
                .arg(number_arg("flags", "user flags stored with the value"))
                .arg(number_arg("expiration", "expiration time in seconds, 0 never expires")),
            SubCommand::with_name("get")
                .about("Get the values of one or more keys")
                .arg(Arg::with_name("KEY").required(true).multiple(true).index(1)),
            SubCommand::with_name("incr")
                .about("Increment a counter")
                .arg(Arg::with_name("KEY").required(true).index(1))
                .arg(number_arg("delta", "amount to add").default_value("1"))
                .arg(number_arg("initial", "value stored when the counter does not exist")),
            SubCommand::with_name("decr")
                .about("Decrement a counter")
                .arg(Arg::with_name("KEY").required(true).index(1))
                .arg(number_arg("delta", "amount to subtract").default_value("1"))
                .arg(number_arg("initial", "value stored when the counter does not exist")),
        ])
        .arg(Arg::with_name("host")
            .long("host")
            .value_name("HOST")
            .global(true)
            .help("admin host of any cluster node [default: localhost]"))
        .arg(Arg::with_name("port")
            .long("port")
            .value_name("PORT")
            .global(true)
            .help("admin port [default: 8091]"))
        .arg(Arg::with_name("pool")
            .long("pool")
            .value_name("POOL")
            .global(true)
            .help("resource pool [default: default]"))
        .arg(Arg::with_name("bucket")
            .long("bucket")
            .value_name("BUCKET")
            .global(true)
            .help("bucket to open [default: default]"))
        .arg(Arg::with_name("username")
            .long("username")
            .value_name("USER")
            .global(true)
            .help("user for the configuration feed"))
        .arg(Arg::with_name("password")
            .long("password")
            .value_name("PASSWORD")
            .global(true)
            .help("password for the configuration feed"))
        .arg(Arg::with_name("config")
            .long("config")
            .value_name("FILE")
            .global(true)
            .help("loads the cluster options from a JSON file"))
        .arg(Arg::with_name("timeout")
            .long("timeout")
            .value_name("SECS")
            .global(true)
            .default_value(DEFAULT_TIMEOUT_SECS)
            .help("how long to wait for results"))
        .arg(Arg::with_name("verbose")
            .long("verbose")
            .short("v")
            .global(true)
            .help("log debug output to stderr"))
        .get_matches();

    // configure a subscriber that will log messages to STDERR
    subscriber_config(matches.is_present("verbose"));

    let opt = parse_options(&matches)?;
    run(opt)
}

fn number_arg<'a>(name: &'a str, help: &'a str) -> Arg<'a, 'a> {
    Arg::with_name(name).long(name).value_name("N").help(help)
}

/// connects to the cluster, runs the action and prints its results
fn run(opt: Opt) -> Result<()> {
    let client = Client::connect(opt.options)?;
    let (tx, rx) = channel::unbounded();

    let expected = match opt.action {
        Action::Set { key, value, options } => {
            client.set(key, value, options, move |result| {
                let _ = tx.send(result);
            })?;
            1
        }
        Action::Get { keys } => {
            let count = keys.len();
            client.get(keys, move |result| {
                let _ = tx.send(result);
            })?;
            count
        }
        Action::Incr { key, options } => {
            client.incr(key, options, move |result| {
                let _ = tx.send(result);
            })?;
            1
        }
        Action::Decr { key, options } => {
            client.decr(key, options, move |result| {
                let _ = tx.send(result);
            })?;
            1
        }
    };

    let deadline = Instant::now() + opt.timeout;
    for _ in 0..expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = rx.recv_timeout(remaining).map_err(|_| VbkvError::Timeout(opt.timeout))?;
        print_result(result)?;
    }
    client.close();
    Ok(())
}

/// prints what the user asked for, `Err` for failed operations
fn print_result(result: OperationResult) -> Result<()> {
    match result.error {
        None => {
            if let Some(counter) = result.counter() {
                println!("{}", counter);
            } else if !result.value.is_empty() {
                println!("{}", String::from_utf8_lossy(&result.value));
            }
            Ok(())
        }
        Some(err) if err.kind == ErrorKind::NotFound => {
            println!("Key not found");
            Ok(())
        }
        Some(err) => Err(VbkvError::Operation(err)),
    }
}

/// parses the matches from the command line into an [`Opt`] struct
fn parse_options(matches: &ArgMatches) -> Result<Opt> {
    let mut options = match matches.value_of("config") {
        Some(path) => ConnectOptions::from_json(File::open(path)?)?,
        None => ConnectOptions::default(),
    };
    if let Some(host) = matches.value_of("host") {
        options = options.hostname(host);
    }
    if let Some(port) = matches.value_of("port") {
        options = options.port(parse_number(port, "port")?);
    }
    if let Some(pool) = matches.value_of("pool") {
        options = options.pool(pool);
    }
    if let Some(bucket) = matches.value_of("bucket") {
        options = options.bucket(bucket);
    }
    if let Some(username) = matches.value_of("username") {
        options.username = Some(username.to_string());
    }
    if let Some(password) = matches.value_of("password") {
        options.password = Some(password.to_string());
    }
    let timeout = Duration::from_secs(parse_number(matches.value_of("timeout").unwrap_or(DEFAULT_TIMEOUT_SECS), "timeout")?);

    let action = match matches.subcommand() {
        ("set", Some(args)) => Action::Set {
            key: args.value_of("KEY").map(String::from).unwrap_or_default(),
            value: args.value_of("VALUE").map(String::from).unwrap_or_default(),
            options: SetOptions {
                flags: optional_number(args, "flags")?.unwrap_or(0),
                expiration: optional_number(args, "expiration")?.unwrap_or(0),
                cas: 0,
            },
        },
        ("get", Some(args)) => Action::Get {
            keys: args.values_of("KEY").map(|keys| keys.map(String::from).collect()).unwrap_or_default(),
        },
        ("incr", Some(args)) => Action::Incr {
            key: args.value_of("KEY").map(String::from).unwrap_or_default(),
            options: arithmetic_options(args)?,
        },
        ("decr", Some(args)) => Action::Decr {
            key: args.value_of("KEY").map(String::from).unwrap_or_default(),
            options: arithmetic_options(args)?,
        },
        _ => return Err(VbkvError::Parsing("a subcommand is required, see --help".to_string())),
    };

    Ok(Opt { options, timeout, action })
}

fn arithmetic_options(args: &ArgMatches) -> Result<ArithmeticOptions> {
    Ok(ArithmeticOptions {
        delta: optional_number(args, "delta")?.unwrap_or(1),
        initial: optional_number(args, "initial")?.unwrap_or(0),
        ..Default::default()
    })
}

fn optional_number<T: std::str::FromStr>(args: &ArgMatches, name: &str) -> Result<Option<T>> {
    args.value_of(name).map(|value| parse_number(value, name)).transpose()
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| VbkvError::Parsing(format!("could not parse {} '{}' as a number", name, value)))
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
