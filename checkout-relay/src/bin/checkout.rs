//! Checkout CLI - Run the identification flow against a relay server
//!
//! Usage:
//!   checkout [--server <url>] [--payload <file>] [--pay] [--reset] [--verbose]
//!
//! Example:
//!   checkout --server http://localhost:3000 --payload signals.json --pay

use anyhow::{Context, Result};
use colored::Colorize;
use relay::bridge::StaticCollector;
use relay::checkout::{Order, PaymentForm};
use relay::metrics::LatencyPanel;
use relay::session::{CookieJar, MemoryStorage};
use relay::{BridgeHandle, CheckoutSession, HttpRelayClient, ProcessingPhase};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_SERVER: &str = "http://localhost:3000";
const DEMO_PAYLOAD: &str = "demo-browser-signals";
const PAYMENT_DELAY: Duration = Duration::from_millis(1500);

fn print_usage() {
    eprintln!(
        r#"
{} - Walk a checkout through Fingerprint identification

{}
    checkout [OPTIONS]

{}
    -s, --server <URL>      Relay server URL (default: http://localhost:3000)
    -p, --payload <FILE>    Signal payload to send (JSON, or raw text)
    --pay                   Submit the mock payment form after identification
    --reset                 Reset the environment and collect again at the end
    -v, --verbose           Show session logs
    -vv                     Extra verbose (debug logs)
    -h, --help              Print this help message

{}
    checkout
    checkout --payload signals.json --pay -v
"#,
        "Checkout CLI".bold(),
        "USAGE:".bold(),
        "OPTIONS:".bold(),
        "EXAMPLES:".bold(),
    );
}

struct CliArgs {
    server: String,
    payload: Option<PathBuf>,
    pay: bool,
    reset: bool,
    verbose: u8, // 0=warnings, 1=info, 2=debug
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        std::process::exit(0);
    }

    let mut server = DEFAULT_SERVER.to_string();
    let mut payload = None;
    let mut pay = false;
    let mut reset = false;
    let mut verbose: u8 = 0;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                i += 1;
                if i < args.len() {
                    server = args[i].clone();
                }
            }
            "--payload" | "-p" => {
                i += 1;
                if i < args.len() {
                    payload = Some(PathBuf::from(&args[i]));
                }
            }
            "--pay" => pay = true,
            "--reset" => reset = true,
            "--verbose" | "-v" => verbose = verbose.max(1),
            "-vv" => verbose = 2,
            other => {
                eprintln!("{} {}", "Ignoring unknown argument:".yellow(), other);
            }
        }
        i += 1;
    }

    CliArgs {
        server,
        payload,
        pay,
        reset,
        verbose,
    }
}

fn load_payload(path: Option<&PathBuf>) -> Result<Value> {
    let Some(path) = path else {
        return Ok(Value::String(DEMO_PAYLOAD.to_string()));
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload file: {}", path.display()))?;
    let raw = raw.trim().to_string();
    Ok(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
}

fn print_panel(session: &CheckoutSession) {
    let snapshot = session.snapshot();
    let panel = LatencyPanel::from_snapshot(&snapshot);

    let headline = match snapshot.phase {
        ProcessingPhase::Complete => panel.headline.green().bold(),
        ProcessingPhase::Error => panel.headline.red().bold(),
        ProcessingPhase::Stored => panel.headline.green(),
        _ => panel.headline.yellow(),
    };
    eprintln!();
    eprintln!("{} {}", format!("[{}]", snapshot.phase).dimmed(), headline);
    for (label, value) in &panel.lines {
        eprintln!("  {} {}", format!("{label}:").dimmed(), value.cyan());
    }
    if let Some(note) = &panel.note {
        eprintln!("  {}", note.italic());
    }
}

fn demo_form() -> PaymentForm {
    PaymentForm {
        email: "demo@example.com".to_string(),
        name_on_card: "Demo Buyer".to_string(),
        card_number: "4242 4242 4242 4242".to_string(),
        expiration: "12/30".to_string(),
        cvc: "123".to_string(),
        address: "1 Demo Street".to_string(),
        city: "Springfield".to_string(),
        region: "IL".to_string(),
        postal_code: "62701".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let payload = load_payload(args.payload.as_ref())?;
    let backend = HttpRelayClient::new(&args.server).context("Failed to build relay client")?;

    let session = CheckoutSession::new(
        BridgeHandle::spawn(StaticCollector::new(payload)),
        Arc::new(backend),
        Arc::new(MemoryStorage::new()),
        CookieJar::new(),
    );
    session.register_reset_observer(|| {
        eprintln!("{}", "Environment reset; session storage and cookies cleared".dimmed());
    });

    eprintln!("{} {}", "Relay:".bold(), args.server.cyan());
    print_panel(&session);

    // Each step prints where the session landed, even when it failed
    let result = async {
        session.collect().await?;
        print_panel(&session);
        session.send_to_backend(None).await?;
        print_panel(&session);
        session.complete_identification().await?;
        print_panel(&session);
        Ok::<_, relay::session::SessionError>(())
    }
    .await;

    if let Err(e) = result {
        print_panel(&session);
        return Err(e).context("Identification flow failed");
    }

    let order = Order::demo();
    eprintln!();
    eprintln!("{}", "Order summary".bold());
    for line in order.to_string().lines() {
        eprintln!("  {}", line);
    }

    if args.pay {
        eprintln!();
        eprintln!("{}", "Processing payment...".dimmed());
        match demo_form().submit(&order, PAYMENT_DELAY).await {
            Ok(total) => eprintln!("{} {}", "Payment verified:".green().bold(), total),
            Err(e) => eprintln!("{} {}", "Payment rejected:".red().bold(), e),
        }
    }

    if args.reset {
        session
            .reset_environment()
            .await
            .context("Failed to reset the environment")?;
        print_panel(&session);
    }

    if let Some(visitor_id) = session.snapshot().record.visitor_id {
        println!("{}", visitor_id);
    }

    Ok(())
}
