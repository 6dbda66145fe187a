//! Telegram operator alerts

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use key_pool::Alerter;

/// Posts alerts to a Telegram chat through the Bot API `sendMessage` method.
pub struct TelegramAlerter {
    client: reqwest::Client,
    api_base: String,
    bot_token: Secret<String>,
    chat_id: String,
}

impl TelegramAlerter {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        bot_token: Secret<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            bot_token,
            chat_id: chat_id.into(),
        }
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token.expose()
        )
    }
}

impl Alerter for TelegramAlerter {
    fn id(&self) -> &str {
        "telegram"
    }

    fn send(
        &self,
        message: String,
    ) -> Pin<Box<dyn Future<Output = key_pool::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let body = serde_json::json!({
                "chat_id": self.chat_id,
                "text": message,
            });
            let response = self
                .client
                .post(self.send_message_url())
                .json(&body)
                .send()
                .await
                // reqwest errors embed the URL, which carries the bot token
                .map_err(|e| key_pool::Error::Alert(e.without_url().to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(key_pool::Error::Alert(format!(
                    "telegram returned HTTP {status}"
                )));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn start_mock_telegram(
        status: StatusCode,
    ) -> (String, mpsc::UnboundedReceiver<(String, serde_json::Value)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();

        let app = axum::Router::new().route(
            "/{bot}/sendMessage",
            axum::routing::post(
                move |Path(bot): Path<String>, axum::Json(body): axum::Json<serde_json::Value>| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((bot, body));
                        status
                    }
                },
            ),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, rx)
    }

    #[tokio::test]
    async fn sends_message_to_chat() {
        let (url, mut rx) = start_mock_telegram(StatusCode::OK).await;
        let alerter = TelegramAlerter::new(
            reqwest::Client::new(),
            url,
            Secret::new("123:abc".to_string()),
            "-100987",
        );

        alerter.send("key sk-...wxyz retired".into()).await.unwrap();

        let (bot, body) = rx.recv().await.unwrap();
        assert_eq!(bot, "bot123:abc");
        assert_eq!(body["chat_id"], "-100987");
        assert_eq!(body["text"], "key sk-...wxyz retired");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (url, _rx) = start_mock_telegram(StatusCode::FORBIDDEN).await;
        let alerter = TelegramAlerter::new(
            reqwest::Client::new(),
            url,
            Secret::new("123:abc".to_string()),
            "-1",
        );

        let err = alerter.send("hello".into()).await.unwrap_err();
        assert!(err.to_string().contains("403"), "got: {err}");
    }

    #[tokio::test]
    async fn transport_error_does_not_leak_token() {
        let alerter = TelegramAlerter::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            Secret::new("123:very-secret".to_string()),
            "-1",
        );

        let err = alerter.send("hello".into()).await.unwrap_err();
        assert!(!err.to_string().contains("very-secret"), "got: {err}");
    }
}
