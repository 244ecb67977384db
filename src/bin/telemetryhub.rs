#![allow(unknown_lints)]

#[macro_use]
extern crate log;

use chrono::Utc;
use std::process;
use telemetryhub::config::Args;
use telemetryhub::pipeline::Pipeline;
use telemetryhub::sink::{Console, ConsoleConfig, Null, Sink};

fn build_sink(args: &Args) -> Box<dyn Sink> {
    match (&args.console, &args.null) {
        (Some(console), Some(_)) => {
            warn!("both console and null sinks configured, using console");
            Box::new(Console::new(console))
        }
        (Some(console), None) => Box::new(Console::new(console)),
        (None, Some(null)) => Box::new(Null::new(null)),
        (None, None) => Box::new(Console::new(&ConsoleConfig::default())),
    }
}

fn main() {
    let args = match telemetryhub::config::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    let level = match args.verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let signal = chan_signal::notify(&[chan_signal::Signal::INT, chan_signal::Signal::TERM]);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][{}] {}",
                record.module_path().unwrap_or("-"),
                record.line().unwrap_or(0),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("could not set up logging");

    info!("{} - telemetryhub {}", args.app_name, args.version);

    let sink = build_sink(&args);
    let pipeline = match Pipeline::start(&args, sink) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("could not start: {}", e);
            process::exit(1);
        }
    };

    match signal.recv() {
        Some(sig) => info!("received {:?}", sig),
        None => warn!("signal channel closed"),
    }
    pipeline.shutdown();
}
