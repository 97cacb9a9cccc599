//! HTTP client for the hosted backend's REST and auth endpoints

use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
    anon_key: String,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.http_url(),
            anon_key: config.backend.anon_key.clone(),
            token: Mutex::new(None),
        })
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.token.lock() = token;
    }

    pub fn access_token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .token
            .lock()
            .clone()
            .unwrap_or_else(|| self.anon_key.clone());
        req.header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn check(resp: Response, what: &str) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Http(format!("{} failed: {} - {}", what, status, body)))
    }

    /// `POST /rest/v1/<table>`
    pub async fn insert_row<T: Serialize + ?Sized>(&self, table: &str, row: &T) -> Result<()> {
        let resp = self
            .authorize(self.client.post(self.table_url(table)))
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await?;
        Self::check(resp, &format!("insert into {}", table)).await?;
        Ok(())
    }

    /// `PATCH /rest/v1/<table>?<column>=eq.<value>`
    pub async fn update_rows<T: Serialize + ?Sized>(
        &self,
        table: &str,
        column: &str,
        value: &str,
        patch: &T,
    ) -> Result<()> {
        let resp = self
            .authorize(self.client.patch(self.table_url(table)))
            .query(&[(column, format!("eq.{}", value))])
            .header("Prefer", "return=minimal")
            .json(patch)
            .send()
            .await?;
        Self::check(resp, &format!("update {}", table)).await?;
        Ok(())
    }

    /// `GET /rest/v1/<table>?select=*&<column>=eq.<value>...`
    pub async fn select_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut query: Vec<(String, String)> = vec![("select".to_string(), "*".to_string())];
        query.extend(
            filters
                .iter()
                .map(|(col, val)| (col.to_string(), format!("eq.{}", val))),
        );

        let resp = self
            .authorize(self.client.get(self.table_url(table)))
            .query(&query)
            .send()
            .await?;
        let resp = Self::check(resp, &format!("select from {}", table)).await?;
        let rows: Vec<T> = resp.json().await?;
        Ok(rows)
    }

    /// `GET /auth/v1/user`; `None` when there is no valid session.
    pub async fn get_user(&self) -> Result<Option<AuthUser>> {
        if self.token.lock().is_none() {
            return Ok(None);
        }

        let resp = self
            .authorize(self.client.get(format!("{}/auth/v1/user", self.base_url)))
            .send()
            .await?;

        if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 {
            return Ok(None);
        }
        let resp = Self::check(resp, "get user").await?;
        let user: AuthUser = resp.json().await?;
        Ok(Some(user))
    }

    pub async fn check_health(&self) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{}/auth/v1/health", self.base_url))
            .header("apikey", &self.anon_key)
            .send()
            .await;

        match resp {
            Ok(r) => Ok(r.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
