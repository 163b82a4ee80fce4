//! a55ctl command-line tool
//!
//! Usage:
//!   a55ctl [--config FILE] send <command...>
//!   a55ctl [--config FILE] event <name> <value>
//!   a55ctl [--config FILE] interactive
//!   a55ctl [--config FILE] params [path]

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use a55ctl::{format_params, load_client_config, ClientConfig, GatewayClient, GatewayReply, LinkError, LinkResult, ParamTable};
use log::error;

const USAGE: &str = "usage: a55ctl [--config FILE] send <command...> | event <name> <value> | interactive | params [path]";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();

    let config = if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            eprintln!("{}", USAGE);
            process::exit(2);
        }
        let path = args.remove(1);
        args.remove(0);
        match load_client_config(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("Error loading configuration {}: {}", path, e);
                process::exit(1);
            }
        }
    } else {
        ClientConfig::default()
    };

    let client = GatewayClient::new(config);
    let result = match args.first().map(String::as_str) {
        Some("send") if args.len() > 1 => send(&client, &args[1..].join(" ")),
        Some("event") if args.len() == 3 => client.send_event(&args[1], &args[2]),
        Some("interactive") => interactive(&client),
        Some("params") => params(&client, args.get(1).map(PathBuf::from)),
        _ => {
            eprintln!("{}", USAGE);
            process::exit(2);
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

/// Forward a command and print the gateway's reply; anything but OK is an error
fn send(client: &GatewayClient, command: &str) -> LinkResult<()> {
    let reply = client.send_command(command)?;
    println!("{}", reply.to_text());
    match reply {
        GatewayReply::Ok => Ok(()),
        GatewayReply::Timeout => Err(LinkError::Timeout),
        GatewayReply::Error(reason) => Err(LinkError::protocol(reason)),
    }
}

/// One command per stdin line until end of input
fn interactive(client: &GatewayClient) -> LinkResult<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("a55> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            return Ok(());
        }
        let line = line.trim();
        match line {
            "" => continue,
            "quit" | "exit" => return Ok(()),
            _ => match client.send_command(line) {
                Ok(reply) => println!("{}", reply.to_text()),
                Err(e) => println!("error: {}", e),
            },
        }
    }
}

fn params(client: &GatewayClient, path: Option<PathBuf>) -> LinkResult<()> {
    let table = match path {
        Some(path) => ParamTable::load(path)?,
        None => client.load_params()?,
    };
    print!("{}", format_params(&table));
    Ok(())
}
