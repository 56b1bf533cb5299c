//! Streams ticks for one symbol through two listeners sharing a single feed.
//!
//! Optional environment variables:
//! - `DERIV_APP_ID`, `DERIV_WS_URL`
//! - `DERIV_SYMBOL` (defaults to `R_100`)
//! - `DERIV_TOKEN` to also follow the account balance

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use deriv_session::{Balance, ErrorEvent, EventHandlers, SessionConfig, SessionManager, Tick};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = SessionConfig::from_env()?;
    let symbol = std::env::var("DERIV_SYMBOL").unwrap_or_else(|_| "R_100".to_string());
    let session = SessionManager::new(config)?;

    session
        .add_listener(
            "monitor",
            EventHandlers::new()
                .on_connection(|up| println!("connection {}", if up { "up" } else { "down" }))
                .on_error(|event: &ErrorEvent| println!("error {}: {}", event.code, event.message)),
        )
        .await?;

    session.connect().await?;
    println!("Connected to {}", session.config().ws_url()?);

    if let Ok(token) = std::env::var("DERIV_TOKEN") {
        let authorization = session.authorize(&token, false).await?;
        println!(
            "Authorized as {} ({} {:.2})",
            authorization.loginid, authorization.currency, authorization.balance
        );
        session
            .subscribe_balance("monitor", |balance: &Balance| {
                println!("balance {} {:.2}", balance.currency, balance.balance)
            })
            .await?;
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    session
        .subscribe_ticks(&symbol, "printer", move |tick: &Tick| {
            counter.fetch_add(1, Ordering::Relaxed);
            let time = tick
                .time()
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            println!("{time} {} {:.*}", tick.symbol, tick.pip_size as usize, tick.price);
        })
        .await?;
    session
        .subscribe_ticks(&symbol, "sampler", |tick: &Tick| {
            tracing::debug!(symbol = %tick.symbol, price = tick.price, "sampled");
        })
        .await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(60)) => println!("Done"),
    }

    println!("Received {} ticks", seen.load(Ordering::Relaxed));
    let forgotten = session.forget_all_subscriptions().await?;
    println!("Forgot {forgotten} subscriptions");
    session.disconnect().await?;
    Ok(())
}
