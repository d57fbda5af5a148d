//! Keep one account connected and print what arrives.
//!
//! Demonstrates:
//! - Loading settings from the environment
//! - Picking a transport with `create_transport`
//! - Running the reconnect supervisor until Ctrl+C
//!
//! Environment:
//!   COOKIES_STR       Cookie string copied from a logged-in session (required)
//!   USE_BROWSER_MODE  `true` to ride the page's own socket
//!   ACCESS_TOKEN      Access token for direct mode
//!   GOOFISH_DEBUG     Any value enables debug logging
//!
//! Usage:
//!   COOKIES_STR='unb=...; cookie2=...' cargo run --example supervise

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use goofish_transport::{
    Message, PlainPayload, ReconnectSupervisor, Result, Settings, StaticTokenSource,
    create_transport,
};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    init_logging(std::env::var_os("GOOFISH_DEBUG").is_some());

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    println!("=== Goofish supervisor ===\n");

    let settings = Settings::from_env()?;
    println!("[1] Mode: {:?}", settings.mode);
    println!("    User: {}\n", settings.credentials.user_id());

    let token = std::env::var("ACCESS_TOKEN").unwrap_or_default();
    let transport = create_transport(
        &settings,
        Arc::new(StaticTokenSource::new(token)),
        Arc::new(PlainPayload),
    );

    let supervisor = ReconnectSupervisor::new(settings.supervisor);
    let stop = supervisor.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        println!("\n[Ctrl+C] Stopping...");
        stop.stop();
    });

    println!("[2] Running, press Ctrl+C to exit\n");
    supervisor
        .run(transport.as_ref(), Arc::new(print_message))
        .await;

    println!("    ✓ Stopped");
    Ok(())
}

// ============================================================================
// Functions
// ============================================================================

fn init_logging(debug: bool) {
    let filter = if debug {
        "goofish_transport=debug"
    } else {
        "goofish_transport=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

fn print_message(message: Message) {
    match message.item_id() {
        Some(item) => println!(
            "[{}] {} ({item}): {}",
            message.kind(),
            message.chat_id(),
            message.content()
        ),
        None => println!(
            "[{}] {}: {}",
            message.kind(),
            message.chat_id(),
            message.content()
        ),
    }
}
