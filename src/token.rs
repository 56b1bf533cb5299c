use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::{
    config::TokenExchangeConfig,
    errors::{Error, Result},
    types::AccountId,
};

/// Source of account-scoped API tokens, consulted during an account switch.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn account_token(&self, account: &AccountId) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    account_id: Option<AccountId>,
    #[serde(default)]
    message: Option<String>,
}

/// Fetches tokens from the backend's `get-token` endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenExchange {
    http: Client,
    endpoint: Url,
    bearer: Option<String>,
}

impl HttpTokenExchange {
    pub fn new(config: &TokenExchangeConfig) -> Result<Self> {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(http: Client, config: &TokenExchangeConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(Error::Config("token_exchange.base_url is not set".to_string()));
        }
        let endpoint = Url::parse(&config.base_url)?.join(&config.path)?;
        Ok(Self {
            http,
            endpoint,
            bearer: config.bearer.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn account_token(&self, account: &AccountId) -> Result<String> {
        let mut request = self
            .http
            .get(self.endpoint.clone())
            .query(&[("account_id", account.as_str())]);
        if let Some(bearer) = &self.bearer {
            request = request.bearer_auth(bearer);
        }

        let response = request
            .send()
            .await
            .map_err(|err| Error::TokenExchange(format!("request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::TokenExchange(format!("endpoint returned {status}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| Error::TokenExchange(format!("invalid response body: {err}")))?;
        tracing::debug!(
            account = %account,
            success = body.success,
            has_token = body.token.is_some(),
            issued_for = ?body.account_id,
            "token exchange response"
        );

        match body.token {
            Some(token) if body.success && !token.is_empty() => Ok(token),
            _ => Err(Error::TokenExchange(
                body.message
                    .unwrap_or_else(|| "token not available".to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config(base_url: String, bearer: Option<&str>) -> TokenExchangeConfig {
        TokenExchangeConfig {
            base_url,
            bearer: bearer.map(str::to_string),
            ..TokenExchangeConfig::default()
        }
    }

    #[tokio::test]
    async fn returns_token_for_account() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/auth/deriv/get-token")
            .match_query(Matcher::UrlEncoded("account_id".into(), "CR100".into()))
            .match_header("authorization", "Bearer session-jwt")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success":true,"token":"a1-scoped","account_id":"CR100"}"#)
            .create_async()
            .await;

        let exchange = HttpTokenExchange::new(&config(server.url(), Some("session-jwt"))).unwrap();
        let token = exchange.account_token(&AccountId::from("CR100")).await.unwrap();

        assert_eq!(token, "a1-scoped");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unsuccessful_body_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/auth/deriv/get-token")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success":false,"message":"account not linked"}"#)
            .create_async()
            .await;

        let exchange = HttpTokenExchange::new(&config(server.url(), None)).unwrap();
        let err = exchange
            .account_token(&AccountId::from("VRTC1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenExchange(message) if message == "account not linked"));
    }

    #[tokio::test]
    async fn http_failure_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/auth/deriv/get-token")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let exchange = HttpTokenExchange::new(&config(server.url(), None)).unwrap();
        let err = exchange
            .account_token(&AccountId::from("CR1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenExchange(_)));
    }

    #[test]
    fn missing_base_url_is_rejected() {
        assert!(matches!(
            HttpTokenExchange::new(&TokenExchangeConfig::default()),
            Err(Error::Config(_))
        ));
    }
}
