use reqwest::Client;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

pub struct NotificationService {
    pub client: Client,
    pub fcm_api_key: Option<String>,
}

impl NotificationService {
    pub fn new(fcm_api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            fcm_api_key,
        }
    }

    /// Push to every registered device of a user and persist an in-app
    /// notification row. Best effort: booking flows never fail because a
    /// push did not go through.
    pub async fn notify_user(
        &self,
        pool: &PgPool,
        user_id: Uuid,
        title: &str,
        body: &str,
        data: Option<serde_json::Value>,
    ) {
        if let Err(e) = self.notify_user_inner(pool, user_id, title, body, data).await {
            tracing::warn!("notification to user {user_id} failed: {e:#}");
        }
    }

    async fn notify_user_inner(
        &self,
        pool: &PgPool,
        user_id: Uuid,
        title: &str,
        body: &str,
        data: Option<serde_json::Value>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO notifications (id, user_id, title, body, data, created_at)
             VALUES ($1, $2, $3, $4, $5, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(title)
        .bind(body)
        .bind(data.clone().unwrap_or_else(|| json!({})))
        .execute(pool)
        .await?;

        let tokens: Vec<(String, String)> =
            sqlx::query_as("SELECT platform, token FROM push_tokens WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(pool)
                .await?;

        for (platform, token) in tokens {
            match platform.as_str() {
                // iOS devices also go through FCM
                "android" | "ios" => {
                    let _ = self.send_fcm(&token, title, body, data.clone()).await;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn send_fcm(
        &self,
        token: &str,
        title: &str,
        body: &str,
        data: Option<serde_json::Value>,
    ) -> anyhow::Result<()> {
        let api_key = match &self.fcm_api_key {
            Some(k) => k,
            None => {
                tracing::debug!("FCM not configured, skipping push notification");
                return Ok(());
            }
        };

        let mut payload = json!({
            "to": token,
            "notification": {
                "title": title,
                "body": body,
            }
        });
        if let Some(d) = data {
            payload["data"] = d;
        }

        let response = self
            .client
            .post("https://fcm.googleapis.com/fcm/send")
            .header("Authorization", format!("key={}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::warn!("FCM error {}: {}", status, text);
        }
        Ok(())
    }
}
