use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use super::{task::Command, SessionManager};
use crate::{
    dispatcher::Event,
    errors::{Error, Result},
    protocol::Authorization,
    timings::time_async_block,
    types::{AccountId, FeedKey},
};

/// Steps of an account switch, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchStep {
    ForgetSubscriptions,
    Reconnect,
    ExchangeToken,
    Authorize,
    RefreshAccount,
    Validate,
}

impl SwitchStep {
    pub fn next(self) -> Option<SwitchStep> {
        match self {
            SwitchStep::ForgetSubscriptions => Some(SwitchStep::Reconnect),
            SwitchStep::Reconnect => Some(SwitchStep::ExchangeToken),
            SwitchStep::ExchangeToken => Some(SwitchStep::Authorize),
            SwitchStep::Authorize => Some(SwitchStep::RefreshAccount),
            SwitchStep::RefreshAccount => Some(SwitchStep::Validate),
            SwitchStep::Validate => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwitchStep::ForgetSubscriptions => "switch.forget_subscriptions",
            SwitchStep::Reconnect => "switch.reconnect",
            SwitchStep::ExchangeToken => "switch.exchange_token",
            SwitchStep::Authorize => "switch.authorize",
            SwitchStep::RefreshAccount => "switch.refresh_account",
            SwitchStep::Validate => "switch.validate",
        }
    }
}

impl fmt::Display for SwitchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Held for the duration of a switch; releases the flag on drop.
struct SwitchGuard(Arc<AtomicBool>);

impl SwitchGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SwitchGuard(Arc::clone(flag)))
    }
}

impl Drop for SwitchGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Data carried between steps.
#[derive(Default)]
struct SwitchState {
    token: Option<String>,
    authorization: Option<Authorization>,
}

impl SessionManager {
    /// Re-scope the session to `target`.
    ///
    /// Runs forget, reconnect, token exchange, authorize, balance refresh and
    /// account validation in order. The first failing step ends the switch
    /// with [`Error::SwitchFailed`]; nothing is retried. A second switch while
    /// one is running is rejected with [`Error::SwitchInProgress`].
    pub async fn switch_account(&self, target: impl Into<AccountId>) -> Result<Authorization> {
        let target = target.into();
        let _guard = SwitchGuard::acquire(&self.switching).ok_or(Error::SwitchInProgress)?;
        let tokens = self
            .tokens
            .clone()
            .ok_or_else(|| Error::Config("no token exchange configured".to_string()))?;

        tracing::info!(account = %target, from = ?self.current_account(), "account switch started");
        let mut state = SwitchState::default();
        let mut step = SwitchStep::ForgetSubscriptions;
        loop {
            let outcome = match step {
                SwitchStep::ForgetSubscriptions => {
                    time_async_block(step.as_str(), self.forget_all_subscriptions())
                        .await
                        .map(drop)
                }
                SwitchStep::Reconnect => {
                    time_async_block(step.as_str(), self.force_reconnection()).await
                }
                SwitchStep::ExchangeToken => {
                    time_async_block(step.as_str(), tokens.account_token(&target))
                        .await
                        .map(|token| state.token = Some(token))
                }
                SwitchStep::Authorize => match state.token.take() {
                    Some(token) => time_async_block(step.as_str(), self.authorize(&token, false))
                        .await
                        .map(|authorization| state.authorization = Some(authorization)),
                    None => Err(Error::TokenExchange("no token obtained".to_string())),
                },
                SwitchStep::RefreshAccount => {
                    time_async_block(step.as_str(), self.refresh_account()).await
                }
                SwitchStep::Validate => validate(&target, state.authorization.as_ref()),
            };

            if let Err(source) = outcome {
                tracing::error!(account = %target, %step, error = %source, "account switch failed");
                return Err(Error::SwitchFailed {
                    step,
                    source: Box::new(source),
                });
            }
            tracing::debug!(account = %target, %step, "switch step done");

            match step.next() {
                Some(next) => step = next,
                None => break,
            }
        }

        tracing::info!(account = %target, "account switch completed");
        state.authorization.ok_or_else(|| Error::SwitchFailed {
            step: SwitchStep::Validate,
            source: Box::new(Error::NotAuthorized),
        })
    }

    /// Fetch the balance, keep the balance feed alive and hand the fresh
    /// value to every balance listener.
    async fn refresh_account(&self) -> Result<()> {
        let balance = self.get_balance().await?;
        self.call(|reply| Command::EnsureFeed {
            key: FeedKey::Balance,
            reply,
        })
        .await??;
        let delivered = self
            .call(|reply| Command::Broadcast {
                event: Event::Balance(balance),
                reply,
            })
            .await?;
        tracing::debug!(delivered, "refreshed balance broadcast");
        Ok(())
    }
}

fn validate(target: &AccountId, authorization: Option<&Authorization>) -> Result<()> {
    match authorization {
        Some(authorization) if authorization.loginid == *target => Ok(()),
        other => Err(Error::AccountMismatch {
            expected: target.clone(),
            actual: other.map(|authorization| authorization.loginid.clone()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_run_in_protocol_order() {
        let order: Vec<_> =
            std::iter::successors(Some(SwitchStep::ForgetSubscriptions), |step| step.next())
                .collect();
        assert_eq!(
            order,
            vec![
                SwitchStep::ForgetSubscriptions,
                SwitchStep::Reconnect,
                SwitchStep::ExchangeToken,
                SwitchStep::Authorize,
                SwitchStep::RefreshAccount,
                SwitchStep::Validate,
            ]
        );
    }

    #[test]
    fn guard_admits_one_switch_at_a_time() {
        let flag = Arc::new(AtomicBool::new(false));
        let first = SwitchGuard::acquire(&flag).expect("first");
        assert!(SwitchGuard::acquire(&flag).is_none());
        drop(first);
        assert!(SwitchGuard::acquire(&flag).is_some());
    }

    #[test]
    fn validation_requires_matching_login() {
        let authorization = Authorization {
            loginid: AccountId::from("CR2"),
            currency: "USD".to_string(),
            balance: 10.0,
            is_virtual: false,
            account_list: Vec::new(),
        };
        assert!(validate(&AccountId::from("CR2"), Some(&authorization)).is_ok());
        match validate(&AccountId::from("CR3"), Some(&authorization)) {
            Err(Error::AccountMismatch { expected, actual }) => {
                assert_eq!(expected, AccountId::from("CR3"));
                assert_eq!(actual, Some(AccountId::from("CR2")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            validate(&AccountId::from("CR3"), None),
            Err(Error::AccountMismatch { actual: None, .. })
        ));
    }
}
