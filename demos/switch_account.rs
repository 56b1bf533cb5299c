//! Authorizes with one account, then switches to another through the
//! token exchange backend.
//!
//! Required environment variables (from .env):
//! - `DERIV_TOKEN` - token of the starting account
//! - `DERIV_TARGET_ACCOUNT` - loginid to switch to
//! - `DERIV_TOKEN_BASE_URL` - token exchange backend
//!
//! Optional: `DERIV_TOKEN_BEARER`, `DERIV_APP_ID`, `DERIV_WS_URL`.

use deriv_session::{Balance, Error, SessionConfig, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter("info").init();

    let token = std::env::var("DERIV_TOKEN")?;
    let target = std::env::var("DERIV_TARGET_ACCOUNT")?;
    let config = SessionConfig::from_env()?;
    let session = SessionManager::new(config)?;

    session.connect().await?;
    let authorization = session.authorize(&token, false).await?;
    println!("Authorized as {}", authorization.loginid);
    for account in &authorization.account_list {
        println!(
            "  {} {}{}",
            account.loginid,
            account.currency,
            if account.is_virtual { " (virtual)" } else { "" }
        );
    }

    session
        .subscribe_balance("demo", |balance: &Balance| {
            println!("balance[{}] {} {:.2}", balance.loginid, balance.currency, balance.balance)
        })
        .await?;

    match session.switch_account(target.as_str()).await {
        Ok(authorization) => println!(
            "Switched to {} ({} {:.2})",
            authorization.loginid, authorization.currency, authorization.balance
        ),
        Err(Error::SwitchFailed { step, source }) => {
            println!("Switch failed at {step}: {source}");
            println!("Still on {:?}", session.current_account());
        }
        Err(err) => return Err(err.into()),
    }

    let balance = session.get_balance().await?;
    println!("Current balance {} {:.2}", balance.currency, balance.balance);
    session.disconnect().await?;
    Ok(())
}
