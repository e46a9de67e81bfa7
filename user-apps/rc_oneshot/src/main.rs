use clap::{arg, App, AppSettings, Arg, ArgMatches};

use rdma_link::config::{LinkConfig, Operation, Readiness, RoleSelection};
use rdma_link::log;
use rdma_link::session::{self, SessionReport};
use rdma_link::{LinkError, UDriver};

fn init_logging() {
    // library code logs through `log`, bridge it into the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("log bridge not installed: {}", e);
    }
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("logging not installed: {}", e);
    }
}

fn parse<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, LinkError> {
    match matches.value_of(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| LinkError::Config(format!("invalid --{}: {}", name, raw))),
    }
}

/// Configuration file first, then single flags on top
fn load_config(matches: &ArgMatches) -> Result<LinkConfig, LinkError> {
    let mut cfg = match matches.value_of("config") {
        Some(path) => LinkConfig::from_file(path)?,
        None => LinkConfig::default(),
    };

    if let Some(role) = matches.value_of("role") {
        cfg.role = match role {
            "auto" => RoleSelection::Auto,
            "initiator" => RoleSelection::Initiator,
            "responder" => RoleSelection::Responder,
            other => return Err(LinkError::Config(format!("unknown role {}", other))),
        };
    }
    if let Some(op) = matches.value_of("op") {
        cfg.operation = match op {
            "read" => Operation::Read,
            "write" => Operation::Write,
            other => return Err(LinkError::Config(format!("unknown op {}", other))),
        };
    }
    if let Some(readiness) = matches.value_of("readiness") {
        cfg.readiness = match readiness {
            "ack" => Readiness::Acknowledge,
            "delay" => Readiness::Delay,
            other => return Err(LinkError::Config(format!("unknown readiness {}", other))),
        };
    }
    if let Some(peer) = matches.value_of("peer") {
        cfg.peer = peer.to_string();
    }
    if let Some(port) = parse(matches, "port")? {
        cfg.port = port;
    }
    if let Some(budget) = parse(matches, "poll_budget")? {
        cfg.poll_budget = budget;
    }
    if let Some(index) = parse(matches, "device")? {
        cfg.device_index = index;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn print_head(report: &SessionReport) {
    let digits: String = report.head.iter().map(|b| b.to_string()).collect();
    println!("{}", digits);
}

fn run(matches: &ArgMatches) -> Result<(), LinkError> {
    let cfg = load_config(matches)?;
    let driver = UDriver::create()?;
    log::info!(
        "provider {} lists {} device(s)",
        driver.provider().name(),
        driver.devices().len()
    );

    if matches.is_present("loopback") {
        let (initiator, responder) = session::run_loopback(&driver, &cfg)?;
        print_head(&initiator);
        print_head(&responder);
    } else {
        print_head(&session::run_tcp(&driver, &cfg)?);
    }
    Ok(())
}

fn main() {
    let matches = App::new("rc_oneshot")
        .version("0.1")
        .about("One RDMA READ or WRITE over a freshly connected RC queue pair")
        .setting(AppSettings::AllArgsOverrideSelf)
        .args(&[
            arg!(--config [PATH] "JSON configuration file"),
            arg!(--role [ROLE] "auto, initiator or responder"),
            arg!(--peer [HOST] "host of the initiator, used by the responder"),
            arg!(--port [PORT] "TCP port of the rendezvous"),
            arg!(--op [OP] "read or write"),
            Arg::new("poll_budget")
                .long("poll-budget")
                .takes_value(true)
                .value_name("N")
                .help("polls before giving up on the completion"),
            arg!(--readiness [MODE] "ack or delay"),
            arg!(--device [INDEX] "index in the device list"),
            arg!(--loopback "run both roles in this process"),
        ])
        .get_matches();

    init_logging();

    if let Err(e) = run(&matches) {
        log::error!("{}", e);
        eprintln!("rc_oneshot: {}", e);
        std::process::exit(1);
    }
}
