use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use dragnet::net::wire::Client;
use std::io::Read;

fn cli() -> Command {
    Command::new("sendreq")
        .about("send one framed JSON request to a service socket")
        .arg(
            Arg::new("socket")
                .value_name("SOCKET")
                .required(true)
                .help("path to the service's unix socket"),
        )
        .arg(
            Arg::new("body")
                .value_name("JSON")
                .required(true)
                .help("request body"),
        )
        .arg(
            Arg::new("pass-fd")
                .long("pass-fd")
                .value_name("FILE")
                .help("create FILE and pass its descriptor before the request"),
        )
        .arg(
            Arg::new("recv-fd")
                .long("recv-fd")
                .action(ArgAction::SetTrue)
                .help("receive a descriptor instead of a response frame and wait for its EOF"),
        )
}

fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let socket = matches.get_one::<String>("socket").unwrap();
    let body = matches.get_one::<String>("body").unwrap();

    // reject malformed bodies before bothering the service
    serde_json::from_str::<serde_json::Value>(body).context("request body is not JSON")?;

    let mut client = Client::connect(socket).context("connecting to service")?;

    if let Some(path) = matches.get_one::<String>("pass-fd") {
        let file = std::fs::File::create(path).context("creating pass-fd file")?;
        client.send_fd(&file).context("passing descriptor")?;
    }

    client
        .send_msg(body.as_bytes())
        .context("sending request")?;

    if matches.get_flag("recv-fd") {
        let fd = client.recv_fd().context("receiving descriptor")?;
        eprintln!("descriptor received, waiting for completion");
        let mut sink = Vec::new();
        std::fs::File::from(fd)
            .read_to_end(&mut sink)
            .context("waiting for completion")?;
        eprintln!("done");
        return Ok(());
    }

    let response = client.recv_msg().context("receiving response")?;
    println!("{}", String::from_utf8_lossy(&response));
    Ok(())
}
