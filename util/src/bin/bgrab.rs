use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use dragnet::scan::{ScanOpts, Scanner};
use openssl::ssl::{SslConnector, SslMethod};
use plinth::logging::{self, info};
use sloggers::types::Severity;
use std::io::Write;
use std::time::Duration;
use util::banner::{self, BannerGrabber};

fn cli() -> Command {
    Command::new("bgrab")
        .about("grab service banners from a list of host:port targets")
        .arg(
            Arg::new("targets")
                .value_name("HOST:PORT")
                .num_args(1..)
                .required(true)
                .help("targets; names resolve to all their addresses"),
        )
        .arg(
            Arg::new("tls")
                .long("tls")
                .action(ArgAction::SetTrue)
                .help("negotiate TLS and record peer certificate chains"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("write records to FILE instead of stdout"),
        )
        .arg(
            Arg::new("max-clients")
                .long("max-clients")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .default_value("16")
                .help("maximum concurrent connections"),
        )
        .arg(
            Arg::new("connects-per-tick")
                .long("connects-per-tick")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .default_value("8")
                .help("new connections initiated per loop pass"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("SECS")
                .value_parser(clap::value_parser!(u64).range(1..))
                .default_value("5")
                .help("per-connection deadline"),
        )
        .arg(
            Arg::new("mdelay")
                .long("mdelay")
                .value_name("MSECS")
                .value_parser(clap::value_parser!(u64))
                .default_value("0")
                .help("throttle delay when the producer asks to wait"),
        )
        .arg(
            Arg::new("resolvers")
                .short('r')
                .long("resolvers")
                .value_name("N")
                .value_parser(clap::builder::RangedU64ValueParser::<usize>::new().range(1..))
                .default_value("10")
                .help("resolver threads for name expansion"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("debug logging"),
        )
}

fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let level = match matches.get_flag("verbose") {
        true => Severity::Debug,
        false => Severity::Info,
    };
    let log = logging::terminal(level);

    let specs = matches
        .get_many::<String>("targets")
        .unwrap()
        .map(|arg| banner::parse_spec(arg))
        .collect::<Result<Vec<_>, _>>()
        .map_err(anyhow::Error::msg)?;

    let resolvers = *matches.get_one::<usize>("resolvers").unwrap();
    let targets = banner::expand_targets(&specs, resolvers, &log)?;
    if targets.is_empty() {
        anyhow::bail!("no connectable targets after resolution");
    }
    info!(log, "scanning"; "targets" => targets.len());

    let tls = matches.get_flag("tls");
    let connector = match tls {
        true => Some(
            SslConnector::builder(SslMethod::tls())
                .context("TLS context")?
                .build(),
        ),
        false => None,
    };

    let out: Box<dyn Write> = match matches.get_one::<String>("output") {
        Some(path) => Box::new(std::fs::File::create(path).context("output file")?),
        None => Box::new(std::io::stdout().lock()),
    };

    let grabber = BannerGrabber::new(targets, tls, out, log.clone());

    let opts = ScanOpts {
        max_clients: *matches.get_one::<usize>("max-clients").unwrap(),
        connects_per_tick: *matches.get_one::<usize>("connects-per-tick").unwrap(),
        timeout: Duration::from_secs(*matches.get_one::<u64>("timeout").unwrap()),
        mdelay_per_tick: Duration::from_millis(*matches.get_one::<u64>("mdelay").unwrap()),
        tls: connector,
    };

    let mut scanner = Scanner::new(opts, grabber, log.clone())?;
    scanner.run().context("scan failed")?;

    let grabber = scanner.into_prober();
    info!(log, "scan complete";
          "grabbed" => grabber.grabbed, "write_errors" => grabber.write_errors);

    let failed = grabber.write_errors > 0;
    let mut out = grabber.into_output();
    out.flush().context("flushing output")?;

    if failed {
        anyhow::bail!("some records could not be written");
    }
    Ok(())
}
