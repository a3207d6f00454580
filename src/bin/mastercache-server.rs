//! this binary starts the reference master server over an in-memory table store
//! to see the list of options, type: `mastercache-server --help`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::process::exit;

use clap::{crate_version, App, Arg, ArgMatches};
use mastercache::thread_pool::{RayonThreadPool, SharedQueueThreadPool, ThreadPool};
use mastercache::{CacheError, MasterServer, MemoryStore, PoolKind, Result, ServerConfig, DEFAULT_ADDRESS};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    addr: SocketAddr,
    config: ServerConfig,
}

impl Opt {
    /// builds the server configuration from the config file, if any, and then applies the
    /// command line overrides
    ///
    /// # Errors
    /// returns [`CacheError::Parsing`] if one of the parameters is invalid
    fn build(matches: &ArgMatches) -> Result<Opt> {
        let mut config = match matches.value_of("config") {
            Some(path) => ServerConfig::load(Path::new(path))?,
            None => ServerConfig::default(),
        };
        if let Some(addr) = matches.value_of("addr") {
            config.addr = addr.to_string();
        }
        if let Some(pool) = matches.value_of("pool") {
            config.pool = pool.parse()?;
        }
        if let Some(threads) = matches.value_of("threads") {
            config.threads = threads
                .parse()
                .ok()
                .filter(|t| *t > 0)
                .ok_or_else(|| CacheError::Parsing(format!("invalid thread count: {}", threads)))?;
        }

        let addr: SocketAddr = config.addr.parse().map_err(|_| {
            CacheError::Parsing(format!(
                "could not parse {} into an IP address and port",
                &config.addr
            ))
        })?;
        Ok(Opt { addr, config })
    }
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    // parse command line args
    let matches = App::new("mastercache-server")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("a reference master server that pushes table invalidations to its clients")
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .value_name("IP_ADDR:PORT")
                .help(&format!(
                    "sets the IP_ADDR:PORT that the server listens on [default: {}]",
                    DEFAULT_ADDRESS
                )),
        )
        .arg(
            Arg::with_name("pool")
                .long("pool")
                .value_name("POOL")
                .possible_values(&["shared", "rayon"])
                .help("sets the thread pool connections are served on [default: shared]"),
        )
        .arg(
            Arg::with_name("threads")
                .long("threads")
                .value_name("N")
                .help("sets the number of worker threads, one per open client connection [default: 16]"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("reads users, table dependencies and defaults from a JSON file"),
        )
        .get_matches();

    // validate command line options, store them in Opt
    let opt = match Opt::build(&matches) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{}", err);
            exit(1);
        }
    };

    // start the server
    if let Err(e) = run(opt) {
        eprintln!("{}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    info!("mastercache-server {}", env!("CARGO_PKG_VERSION"));
    info!("Thread pool: {} x {}", opt.config.pool, opt.config.threads);
    info!("Listening on {}", opt.addr);

    let dependents: HashMap<_, _> = opt.config.dependents.clone().into_iter().collect();
    let store = MemoryStore::with_dependents(dependents);

    match opt.config.pool {
        PoolKind::Shared => run_with_pool(store, SharedQueueThreadPool::new(opt.config.threads)?, &opt),
        PoolKind::Rayon => run_with_pool(store, RayonThreadPool::new(opt.config.threads)?, &opt),
    }
}

fn run_with_pool<P: ThreadPool>(store: MemoryStore, pool: P, opt: &Opt) -> Result<()> {
    if opt.config.users.is_empty() {
        info!("no users configured, every handshake is accepted");
    }
    let server = MasterServer::new(store, pool)
        .with_users(opt.config.users.clone())
        .with_keepalive(opt.config.keepalive());
    server.run(opt.addr)
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        // all spans/events with a level higher than DEBUG (e.g, info, warn, etc.)
        // will be written.
        .with_max_level(Level::DEBUG)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        // completes the builder.
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
