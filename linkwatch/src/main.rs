#![warn(clippy::all)]

#[macro_use]
extern crate log;

use clap::{crate_version, Parser};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use flate2::read::GzDecoder;
use xz2::read::XzDecoder;

use liblinkwatch::{ObserverContext, ReplayAnalyzer};
use liblinkwatch_tools::{CaptureFileEngine, Config};

mod sink;

use crate::sink::JsonLines;

/// Passive link observation: neighbors, addresses and services seen on the wire
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<String>,

    /// Write malformed and unclassified frames to this capture file
    #[arg(long, value_name = "FILE")]
    pcap_log: Option<String>,

    /// Output directory (log file, diagnostics capture)
    #[arg(short, long)]
    outdir: Option<String>,

    /// Capture only on these interfaces (live mode, default: all)
    #[arg(short, long = "interface", value_name = "IFACE")]
    interfaces: Vec<String>,

    /// Capture file to replay (`-` for stdin). Live capture if absent.
    input: Option<String>,
}

fn load_config(config: &mut Config, filename: &str) -> Result<(), io::Error> {
    debug!("Loading configuration {filename}");
    let path = Path::new(&filename);
    let file = File::open(path)?;
    config
        .load_config(file)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn open_input(input_filename: &str) -> io::Result<Box<dyn io::Read + Send>> {
    let reader: Box<dyn io::Read + Send> = if input_filename == "-" {
        Box::new(io::stdin())
    } else {
        let path = Path::new(input_filename);
        let file = File::open(path)?;
        if input_filename.ends_with(".gz") {
            Box::new(GzDecoder::new(file))
        } else if input_filename.ends_with(".xz") {
            Box::new(XzDecoder::new(file))
        } else if input_filename.ends_with(".lz4") {
            Box::new(lz4::Decoder::new(file)?)
        } else {
            Box::new(file)
        }
    };
    Ok(reader)
}

fn replay(ctx: Arc<ObserverContext>, input_filename: &str, config: &Config) -> io::Result<()> {
    let mut input_reader = open_input(input_filename)?;
    let name = Path::new(input_filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stdin".to_owned());
    let analyzer = ReplayAnalyzer::new(ctx, &name, 1);
    let mut engine = CaptureFileEngine::new(analyzer, config);
    engine.run(&mut input_reader).map_err(io::Error::other)
}

#[cfg(all(feature = "live", target_os = "linux"))]
fn live(ctx: Arc<ObserverContext>, interfaces: Vec<String>, config: &Config) -> io::Result<()> {
    use liblinkwatch_live::LiveEngine;
    use std::sync::atomic::{AtomicBool, Ordering};

    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    ctrlc::set_handler(move || {
        s.store(true, Ordering::SeqCst);
    })
    .map_err(io::Error::other)?;
    let mut engine = LiveEngine::new(ctx, config).with_interfaces(interfaces);
    engine.run(stop).map_err(io::Error::other)
}

#[cfg(not(all(feature = "live", target_os = "linux")))]
fn live(_ctx: Arc<ObserverContext>, _interfaces: Vec<String>, _config: &Config) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "live capture is not available in this build, give an input file",
    ))
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    // load config
    let mut config = Config::default();
    if let Some(filename) = args.config {
        load_config(&mut config, &filename)?;
    }
    // override config options from command-line arguments
    if let Some(dir) = args.outdir {
        config.set("output_dir", dir.as_str());
    }
    if let Some(file) = args.pcap_log {
        config.set("diagnostics.pcap", file.as_str());
    }

    // Open log file
    let log_file = config.get("log_file").unwrap_or("linkwatch.log");
    let output_dir = config.get("output_dir").unwrap_or(".");
    let file_appender = RollingFileAppender::new(Rotation::NEVER, output_dir, log_file);
    let env_filter = EnvFilter::try_from_env("LINKWATCH_LOG")
        .unwrap_or_else(|_| EnvFilter::from_default_env().add_directive(Level::INFO.into()));
    tracing_subscriber::fmt()
        .with_writer(file_appender)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .compact()
        .init();

    // Now, really start
    info!("linkwatch {}", crate_version!());

    let sink = Arc::new(JsonLines::stdout());
    let ctx = ObserverContext::from_config(&config, sink.clone()).map_err(io::Error::other)?;
    let ctx = Arc::new(ctx);

    let res = match args.input.as_deref() {
        Some(input_filename) => replay(ctx.clone(), input_filename, &config),
        None => live(ctx.clone(), args.interfaces, &config),
    };

    let outstanding = ctx.shutdown();
    if outstanding > 0 {
        info!("{} resolutions were still pending", outstanding);
    }
    sink.emit(&serde_json::json!({
        "event": "summary",
        "summary": ctx.summary(),
    }));
    res?;

    info!("linkwatch: done, exiting");
    Ok(())
}
