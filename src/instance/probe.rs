//! Reachability check performed before auto-starting instances.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::Result;

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Any HTTP answer from `url` within the timeout counts as reachable.
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                log::debug!("Probe {} answered {}", self.url, resp.status());
                true
            }
            Err(e) => {
                log::warn!("Probe {} failed: {}", self.url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn any_answer_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let probe = HttpProbe::new(format!("http://{}/", addr), Duration::from_secs(5)).unwrap();
        assert!(probe.check().await);
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpProbe::new(format!("http://{}/", addr), Duration::from_secs(5)).unwrap();
        assert!(!probe.check().await);
    }
}
