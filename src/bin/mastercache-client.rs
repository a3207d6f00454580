//! The mastercache-client executable supports the following command line arguments:
//!
//! `mastercache-client ping [--addr IP-PORT] [--user NAME] [--password PW]`
//!
//!     Measure one round trip to the master.
//!
//! `mastercache-client count <TABLE_ID> [...]`
//!
//!     Print the number of rows the master holds for a table.
//!
//! `mastercache-client invalidate <TABLE_ID> [...]`
//!
//!     Ask the master to invalidate a table in every client, and print the tables it reports
//!     as stale.
//!
//! `mastercache-client listen [...]`
//!
//!     Print every invalidation notice the master pushes, one line per notice, until killed.
//!
//! --addr accepts an IP address, either v4 or v6, and a port number, with the format IP:PORT.
//! If --addr is not specified then connect on 127.0.0.1:4580.
//! --config reads the same settings from a JSON file; command line values win.
//! Print an error and return a non-zero exit code on server error, or if IP-PORT does not parse
//! as an address.
//!
//! `mastercache-client -V`
//!
//!     Print the version.

use std::net::SocketAddr;
use std::path::Path;

use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use mastercache::{CacheError, ClientConfig, MasterConnector, Result, TableId, DEFAULT_ADDRESS};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// the tasks this client can run
#[derive(Debug)]
enum Task {
    Ping,
    Count(TableId),
    Invalidate(TableId),
    Listen,
}

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    config: ClientConfig,
    task: Task,
}

fn main() -> Result<()> {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let table_arg = || {
        Arg::with_name("TABLE_ID")
            .required(true)
            .index(1)
            .help("the numeric id of the table")
    };
    let matches = App::new("mastercache-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("talks to a master server")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommands(vec![
            SubCommand::with_name("ping").about("Measure one round trip to the master"),
            SubCommand::with_name("count")
                .about("Print the number of rows in a table")
                .arg(table_arg()),
            SubCommand::with_name("invalidate")
                .about("Invalidate a table in every client")
                .arg(table_arg()),
            SubCommand::with_name("listen").about("Print invalidation notices as they arrive"),
        ])
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .value_name("IP_ADDR:PORT")
                .global(true)
                .help("sets the IP_ADDR:PORT of the server to connect to"),
        )
        .arg(
            Arg::with_name("user")
                .long("user")
                .value_name("NAME")
                .global(true)
                .help("sets the account to authenticate as [default: admin]"),
        )
        .arg(
            Arg::with_name("password")
                .long("password")
                .value_name("PASSWORD")
                .global(true)
                .help("sets the account's password"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("reads connection settings from a JSON file"),
        )
        .get_matches();

    // parse commands into an Opt struct
    let opt = parse_options(&matches)?;
    run(opt)
}

/// runs the specified task against the master server
fn run(opt: Opt) -> Result<()> {
    let conn = MasterConnector::connect(opt.config)?;
    match opt.task {
        Task::Ping => {
            let rtt = conn.ping()?;
            println!("pong in {:?}", rtt);
        }
        Task::Count(table) => println!("{}", conn.row_count(table)?),
        Task::Invalidate(table) => {
            let list = conn.invalidate_table(table)?;
            for stale in list.iter() {
                println!("{}", stale.0);
            }
        }
        Task::Listen => conn.listen_invalidations(|list| {
            let ids: Vec<String> = list.iter().map(|t| t.0.to_string()).collect();
            println!("{}", ids.join(" "));
            true
        })?,
    }
    Ok(())
}

/// parses the matches from the command line into an [`Opt`] struct
fn parse_options(matches: &ArgMatches) -> Result<Opt> {
    let (name, sub) = matches.subcommand();
    // global args are propagated to the subcommand's matches
    let args = sub.unwrap_or(matches);

    let task = match name {
        "ping" => Task::Ping,
        "count" => Task::Count(parse_table(args)?),
        "invalidate" => Task::Invalidate(parse_table(args)?),
        "listen" => Task::Listen,
        other => return Err(CacheError::Parsing(format!("unknown command: {}", other))),
    };

    let mut builder = match args.value_of("config") {
        Some(path) => ClientConfig::load(Path::new(path))?.into_builder(),
        None => ClientConfig::builder()
            .addr(DEFAULT_ADDRESS)
            .credentials("admin", ""),
    };

    if let Some(addr) = args.value_of("addr") {
        let addr: SocketAddr = addr.parse().map_err(|_| {
            CacheError::Parsing(format!("could not parse {} into an IP address and port", addr))
        })?;
        builder = builder.addr(addr.to_string());
    }
    if let Some(user) = args.value_of("user") {
        let password = args.value_of("password").unwrap_or("");
        builder = builder.credentials(user, password);
    } else if let Some(password) = args.value_of("password") {
        builder = builder.password(password);
    }
    let config = builder
        // a one-shot command does not need to follow other clients' changes
        .monitor_invalidations(false)
        .build()?;

    Ok(Opt { config, task })
}

fn parse_table(args: &ArgMatches) -> Result<TableId> {
    let raw = args.value_of("TABLE_ID").unwrap_or_default();
    raw.parse::<u16>()
        .map(TableId)
        .map_err(|_| CacheError::Parsing(format!("invalid table id: {}", raw)))
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        // only warnings and errors, stdout carries the command's output
        .with_max_level(Level::WARN)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        // completes the builder.
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
