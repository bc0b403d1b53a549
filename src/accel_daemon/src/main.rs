mod daemon;
mod reader;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::daemon::{run_daemon, RunOptions};

fn usage() -> String {
    "usage: accel_daemon --socket <path> [--debug] [--panic-on-exit]\n\
     \n\
     --socket <path>   stream socket to create and listen on (required)\n\
     --debug           default the log filter to debug instead of info\n\
     --panic-on-exit   panic after orderly shutdown (diagnostic)"
        .to_string()
}

fn parse_args() -> Result<RunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        return Err(usage());
    }

    let mut socket_path: Option<PathBuf> = None;
    let mut debug = false;
    let mut panic_on_exit = false;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--socket" | "-s" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --socket".to_string())?;
                socket_path = Some(PathBuf::from(value));
            }
            "--debug" => {
                debug = true;
            }
            "--panic-on-exit" => {
                panic_on_exit = true;
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    let socket_path = socket_path.ok_or_else(|| format!("--socket is required\n{}", usage()))?;
    Ok(RunOptions {
        socket_path,
        debug,
        panic_on_exit,
    })
}

fn main() {
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    let default_filter = if options.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let panic_on_exit = options.panic_on_exit;
    if let Err(err) = run_daemon(options) {
        error!("run accel_daemon failed: {}", err);
        std::process::exit(1);
    }

    if panic_on_exit {
        panic!("panic-on-exit requested");
    }
}
