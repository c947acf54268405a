//! Pulse CLI - Command-line interface for Pagepulse
//!
//! Commands:
//! - replay: Drive a collector with a recorded interaction trace and print
//!   the batches it would send
//! - scrub: Redact PII from text
//! - doctor: Print resolved configuration and capability availability

use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use chrono::{TimeZone, Utc};
use serde::Deserialize;

use pagepulse::capability::{ManualClock, MemoryStorage, MemoryTransport, NoCompressor};
use pagepulse::collector::{Collector, HostCapabilities, InputEvent};
use pagepulse::config::{AttachConfig, CollectorConfig, DetectorTunables};
use pagepulse::document::{NodeDescriptor, StaticDocument};
use pagepulse::envelope::PageContext;
use pagepulse::{scrub, COLLECTOR_VERSION};

/// Pagepulse - behavioral telemetry collector for hosted documents
#[derive(Parser)]
#[command(name = "pulse")]
#[command(version = COLLECTOR_VERSION)]
#[command(about = "Drive and inspect the Pagepulse collector", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded interaction trace through a collector
    Replay {
        /// Input trace file, NDJSON of `{"at_ms": N, ...InputEvent}` (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Site id for the simulated attachment
        #[arg(long, default_value = "site-local")]
        site_id: String,

        /// Api key for the simulated attachment
        #[arg(long, default_value = "pk_local")]
        api_key: String,

        /// Ingest host for the simulated attachment
        #[arg(long, default_value = "https://collect.local")]
        api_host: String,

        /// Page URL the trace was recorded on
        #[arg(long, default_value = "https://example.com/")]
        page_url: String,

        /// Dispatch a page unload at the end of the trace
        #[arg(long)]
        unload: bool,

        /// Pretty-print output batches
        #[arg(long)]
        pretty: bool,
    },

    /// Redact PII from text (file or stdin)
    Scrub {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
    },

    /// Print resolved configuration and capability availability
    Doctor,
}

/// One line of a replay trace: a millisecond offset plus an input event
#[derive(Deserialize)]
struct TraceEntry {
    #[serde(default)]
    at_ms: i64,
    #[serde(flatten)]
    event: InputEvent,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Replay {
            input,
            site_id,
            api_key,
            api_host,
            page_url,
            unload,
            pretty,
        } => run_replay(&input, site_id, api_key, api_host, page_url, unload, pretty),
        Commands::Scrub { input } => run_scrub(&input),
        Commands::Doctor => run_doctor(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn read_input(path: &PathBuf) -> io::Result<String> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        fs::read_to_string(path)
    }
}

#[allow(clippy::too_many_arguments)]
fn run_replay(
    input: &PathBuf,
    site_id: String,
    api_key: String,
    api_host: String,
    page_url: String,
    unload: bool,
    pretty: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = read_input(input)?;

    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let clock = Rc::new(ManualClock::new(start));
    let transport = Rc::new(MemoryTransport::new());
    let document = StaticDocument::new(
        1280.0,
        4000.0,
        vec![NodeDescriptor::new("main"), NodeDescriptor::new("footer")],
    );
    document.set_snapshot(Some("<body/>".to_string()));

    let path = page_url
        .splitn(4, '/')
        .nth(3)
        .map(|p| format!("/{p}"))
        .unwrap_or_else(|| "/".to_string());
    let page = PageContext {
        url: page_url,
        path,
        title: None,
        referrer: None,
        user_agent: format!("pulse-cli/{COLLECTOR_VERSION}"),
        language: "en-US".to_string(),
        screen_width: 1920,
        screen_height: 1080,
        viewport_width: 1280,
        viewport_height: 720,
        document_width: 1280.0,
        document_height: 4000.0,
        scroll_x: 0.0,
        scroll_y: 0.0,
    };

    let mut collector = Collector::attach(
        CollectorConfig::new(AttachConfig {
            site_id,
            api_key,
            api_host,
        }),
        HostCapabilities {
            clock: clock.clone(),
            storage: Rc::new(MemoryStorage::new()),
            transport: transport.clone(),
            compressor: Box::new(NoCompressor),
        },
        document,
        page,
    );

    let mut elapsed_ms = 0i64;
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: TraceEntry = serde_json::from_str(line)
            .map_err(|err| format!("line {}: {err}", line_no + 1))?;
        if entry.at_ms > elapsed_ms {
            clock.advance_ms(entry.at_ms - elapsed_ms);
            elapsed_ms = entry.at_ms;
        }
        collector.dispatch(entry.event);
        collector.tick();
        collector.run_idle();
    }

    // Let trailing timers (dead-click checks, flushes, retries) settle
    for _ in 0..4 {
        clock.advance_ms(2_500);
        collector.tick();
        collector.run_idle();
    }
    if unload {
        collector.dispatch(InputEvent::PageUnload);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for request in transport.drain() {
        let body: serde_json::Value = serde_json::from_slice(&request.body)
            .unwrap_or(serde_json::Value::Null);
        let record = serde_json::json!({
            "method": request.method,
            "url": request.url,
            "body": body,
        });
        if pretty {
            writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
        } else {
            writeln!(out, "{}", serde_json::to_string(&record)?)?;
        }
    }
    Ok(())
}

fn run_scrub(input: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if input.as_os_str() == "-" {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            writeln!(out, "{}", scrub(&line?))?;
        }
    } else {
        for line in fs::read_to_string(input)?.lines() {
            writeln!(out, "{}", scrub(line))?;
        }
    }
    Ok(())
}

fn run_doctor() -> Result<(), Box<dyn std::error::Error>> {
    let tunables = DetectorTunables::default();
    let report = serde_json::json!({
        "version": COLLECTOR_VERSION,
        "capabilities": {
            "gzip": true,
            "storage": "in-memory (host storage supplied at attach)",
            "idle_scheduling": "host-driven (run_idle / run_deferred)",
        },
        "tunables": tunables,
    });

    if atty::is(atty::Stream::Stdout) {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}
