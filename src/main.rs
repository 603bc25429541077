#[macro_use]
extern crate log;

mod broker;
mod cli;
mod driver;
mod error;
mod lifecycle;
mod peer;
mod stats;
mod transport;
mod wire;

use clap::Parser;

use cli::Cli;
use error::LamutexError;

fn main() {
    // Progress lines are a documented stdout contract (spec §6), not a log
    // convenience, so the default stderr target is overridden here.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();

    let args: Vec<String> = std::env::args().collect();

    // The hidden peer role is only ever invoked by `lifecycle::spawn_peer`
    // re-execing this same binary; it is not a user-facing CLI surface and
    // is dispatched before `Cli` parses the normal two-positional-argument
    // form.
    let result = if args.get(1).map(String::as_str) == Some(lifecycle::PEER_ROLE_FLAG) {
        run_peer_role(&args)
    } else {
        run_coordinator_role()
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

fn run_peer_role(args: &[String]) -> Result<(), LamutexError> {
    let id: i32 = parse_arg(args, 2, "peer id")?;
    let npeers: i32 = parse_arg(args, 3, "npeers")?;
    let nrounds: u32 = parse_arg(args, 4, "nrounds")?;
    let port: u16 = parse_arg(args, 5, "port")?;

    driver::run_child(id, npeers, nrounds, port)
}

fn parse_arg<T: std::str::FromStr>(
    args: &[String],
    index: usize,
    name: &str,
) -> Result<T, LamutexError> {
    args.get(index)
        .ok_or_else(|| LamutexError::Usage(format!("missing peer-role argument: {}", name)))?
        .parse()
        .map_err(|_| LamutexError::Usage(format!("invalid peer-role argument: {}", name)))
}

fn run_coordinator_role() -> Result<(), LamutexError> {
    let (npeers, nrounds) = Cli::parse().validate()?;

    let (listener, port) = broker::bind_listener()?;

    let mut children = Vec::with_capacity(npeers as usize);
    for id in 0..npeers as i32 {
        match lifecycle::spawn_peer(id, npeers as i32, nrounds, port) {
            Ok(child) => children.push(child),
            Err(e) => {
                lifecycle::kill_children(&mut children);
                return Err(e.into());
            }
        }
    }

    let connections = match broker::accept_peers(&listener, npeers as i32) {
        Ok(c) => c,
        Err(e) => {
            lifecycle::kill_children(&mut children);
            return Err(e.into());
        }
    };

    let stats = match broker::run(connections, children) {
        Ok(stats) => stats,
        Err(e) => return Err(e.into()),
    };

    println!("{}", stats.output_line());

    Ok(())
}
