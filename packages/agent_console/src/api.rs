//! REST boundary: visitor lists, claims and conversation history.

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::ConsoleConfig;
use crate::error::ConsoleError;
use crate::models::Visitor;
use crate::protocol::{ConversationHistory, TakeVisitorRequest, TakeVisitorResponse, VisitorList};

/// The REST calls the console core depends on.
pub trait VisitorApi: Send + Sync + 'static {
    fn pending_visitors(&self) -> BoxFuture<'static, Result<Vec<Visitor>, ConsoleError>>;

    fn active_visitors(&self) -> BoxFuture<'static, Result<Vec<Visitor>, ConsoleError>>;

    fn take_visitor(
        &self,
        agent_id: String,
        visitor_id: String,
    ) -> BoxFuture<'static, Result<TakeVisitorResponse, ConsoleError>>;

    fn conversation(
        &self,
        session_id: String,
    ) -> BoxFuture<'static, Result<ConversationHistory, ConsoleError>>;
}

/// reqwest-backed implementation.
#[derive(Debug, Clone)]
pub struct HttpVisitorApi {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
}

impl HttpVisitorApi {
    pub fn new(base_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        }
    }

    pub fn from_config(config: &ConsoleConfig) -> Self {
        Self::new(config.http_base.clone(), config.client_id.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn get_json<T: DeserializeOwned + Send + 'static>(
        &self,
        path: String,
    ) -> BoxFuture<'static, Result<T, ConsoleError>> {
        let client = self.client.clone();
        let url = self.url(&path);
        async move {
            debug!(url = %url, "GET");
            let resp = client
                .get(&url)
                .send()
                .await
                .map_err(ConsoleError::from_reqwest)?
                .error_for_status()
                .map_err(ConsoleError::from_reqwest)?;
            resp.json::<T>().await.map_err(ConsoleError::from_reqwest)
        }
        .boxed()
    }
}

impl VisitorApi for HttpVisitorApi {
    fn pending_visitors(&self) -> BoxFuture<'static, Result<Vec<Visitor>, ConsoleError>> {
        self.get_json::<VisitorList>(format!("pending-visitors/{}", self.client_id))
            .map(|r| r.map(VisitorList::into_vec))
            .boxed()
    }

    fn active_visitors(&self) -> BoxFuture<'static, Result<Vec<Visitor>, ConsoleError>> {
        self.get_json::<VisitorList>(format!("active-visitors/{}", self.client_id))
            .map(|r| r.map(VisitorList::into_vec))
            .boxed()
    }

    fn take_visitor(
        &self,
        agent_id: String,
        visitor_id: String,
    ) -> BoxFuture<'static, Result<TakeVisitorResponse, ConsoleError>> {
        let client = self.client.clone();
        let url = self.url("take-visitor");
        async move {
            debug!(url = %url, visitor = %visitor_id, "POST take-visitor");
            let resp = client
                .post(&url)
                .json(&TakeVisitorRequest {
                    agent_id,
                    visitor_id,
                })
                .send()
                .await
                .map_err(ConsoleError::from_reqwest)?;
            // A conflict still carries a JSON body explaining the rejection.
            if resp.status().is_client_error() {
                if let Ok(body) = resp.json::<TakeVisitorResponse>().await {
                    return Ok(body);
                }
                return Ok(TakeVisitorResponse {
                    success: false,
                    message: Some("claim rejected".to_string()),
                    ..Default::default()
                });
            }
            let resp = resp.error_for_status().map_err(ConsoleError::from_reqwest)?;
            resp.json::<TakeVisitorResponse>()
                .await
                .map_err(ConsoleError::from_reqwest)
        }
        .boxed()
    }

    fn conversation(
        &self,
        session_id: String,
    ) -> BoxFuture<'static, Result<ConversationHistory, ConsoleError>> {
        self.get_json(format!("conversation/{}", session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let api = HttpVisitorApi::new("http://127.0.0.1:8000/api/", "acme");
        assert_eq!(
            api.url("pending-visitors/acme"),
            "http://127.0.0.1:8000/api/pending-visitors/acme"
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let api = HttpVisitorApi::new("http://127.0.0.1:1", "acme");
        let err = api.pending_visitors().await.unwrap_err();
        assert!(matches!(err, ConsoleError::Unavailable));
    }
}
