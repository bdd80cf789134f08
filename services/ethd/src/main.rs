use anyhow::{bail, Context};
use serde::Deserialize;
use clap::{Arg, ArgAction, Command};
use dragnet::svc::{self, Service};
use ethd::{capture, ethframe};
use plinth::logging::{self, info};
use plinth::os;
use sloggers::types::Severity;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const DAEMON_NAME: &str = "ethd";

struct Opts {
    basepath: PathBuf,
    user: Option<String>,
    group: Option<String>,
    single: Option<String>,
    no_daemon: bool,
    logging: Option<sloggers::LoggerConfig>,
}

/// Optional config file; command-line flags win over its values.
#[derive(Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    logging: Option<sloggers::LoggerConfig>,
}

fn cli() -> Command {
    Command::new(DAEMON_NAME)
        .about("ether-frame transmit and packet capture daemon")
        .arg(
            Arg::new("user")
                .short('u')
                .long("user")
                .value_name("USER")
                .help("daemon user"),
        )
        .arg(
            Arg::new("group")
                .short('g')
                .long("group")
                .value_name("GROUP")
                .help("daemon group"),
        )
        .arg(
            Arg::new("basepath")
                .short('b')
                .long("basepath")
                .value_name("PATH")
                .required(true)
                .help("working directory basepath"),
        )
        .arg(
            Arg::new("single")
                .short('s')
                .long("single")
                .value_name("NAME")
                .help("name of single service to start"),
        )
        .arg(
            Arg::new("no-daemon")
                .short('n')
                .long("no-daemon")
                .action(ArgAction::SetTrue)
                .help("do not daemonize"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML config file"),
        )
}

fn parse_opts() -> anyhow::Result<Opts> {
    let matches = cli().get_matches();

    let file: FileConfig = match matches.get_one::<String>("config") {
        Some(path) => plinth::config::load_toml(path)?,
        None => FileConfig::default(),
    };

    let opts = Opts {
        basepath: PathBuf::from(matches.get_one::<String>("basepath").unwrap()),
        user: matches.get_one::<String>("user").cloned(),
        group: matches.get_one::<String>("group").cloned(),
        single: matches.get_one::<String>("single").cloned(),
        no_daemon: matches.get_flag("no-daemon"),
        logging: file.logging,
    };

    if !opts.basepath.is_absolute() {
        bail!("basepath must be an absolute path");
    }
    if !opts.no_daemon && (opts.user.is_none() || opts.group.is_none()) {
        bail!("daemon must run as an unprivileged user:group");
    }

    Ok(opts)
}

fn run(opts: &Opts) -> anyhow::Result<()> {
    let uid = opts.user.as_deref().map(os::lookup_uid).transpose()?;
    let gid = opts.group.as_deref().map(os::lookup_gid).transpose()?;

    let daemon_opts = os::DaemonOpts {
        name: DAEMON_NAME,
        basepath: &opts.basepath,
        uid,
        gid,
    };

    if opts.no_daemon {
        os::foreground(&opts.basepath)?;
    } else {
        os::daemonize(&daemon_opts)?;
    }

    let log = match &opts.logging {
        Some(config) => logging::from_config(config)?,
        None => logging::terminal(Severity::Info),
    };
    info!(log, "starting"; "daemon" => DAEMON_NAME);

    let ethframe_def = ethframe::service();
    let capture_def = capture::service();
    let services: [&dyn Service; 2] = [&ethframe_def, &capture_def];

    let result = match &opts.single {
        Some(name) => {
            let svc = services
                .iter()
                .find(|s| s.name() == name.as_str())
                .with_context(|| format!("no such service: {}", name))?;
            let stop = Arc::new(AtomicBool::new(false));
            svc::serve_single(*svc, &opts.basepath, stop, &log)
        }
        None => svc::serve(&opts.basepath, &services, &log),
    };

    if !opts.no_daemon {
        let _ = os::remove_pidfile(&daemon_opts);
    }

    result.context("serve failed")
}

fn main() {
    let opts = match parse_opts() {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("{}: {}", DAEMON_NAME, err);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(&opts) {
        eprintln!("{}: {:#}", DAEMON_NAME, err);
        std::process::exit(1);
    }
}
