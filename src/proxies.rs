use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::future::join_all;
use reqwest::Client;
use sqlx::{PgPool, Row};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::types::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Available,
    Suspended,
}

impl ProxyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyState::Available => "available",
            ProxyState::Suspended => "suspended",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "available" => Ok(ProxyState::Available),
            "suspended" => Ok(ProxyState::Suspended),
            other => Err(Error::General(format!("unknown proxy state: {}", other))),
        }
    }
}

#[derive(Clone)]
pub struct ProxyHandle {
    pub name: String,
    pub client: Client,
}

/// Rotating set of egress proxies with a read-mostly availability cache.
/// The cache is refreshed at most once per configured period and persisted
/// to `proxy_states`; it is allowed to be stale, it is never a source of
/// correctness.
pub struct ProxyPool {
    proxies: Vec<ProxyHandle>,
    anchors: Vec<String>,
    check_period: Duration,
    states: RwLock<HashMap<String, ProxyState>>,
    last_check: Mutex<Option<Instant>>,
}

impl ProxyPool {
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        let mut proxies = Vec::new();

        for proxy_config in &config.proxies {
            let mut builder = Client::builder()
                .user_agent(&config.user_agent)
                .timeout(Duration::from_secs(config.request_timeout_secs))
                .gzip(true)
                .deflate(true)
                .brotli(true)
                .redirect(reqwest::redirect::Policy::limited(10));

            if let Some(url) = &proxy_config.url {
                builder = builder.proxy(reqwest::Proxy::all(url)?);
            }

            proxies.push(ProxyHandle {
                name: proxy_config.name.clone(),
                client: builder.build()?,
            });
        }

        let states = proxies
            .iter()
            .map(|proxy| (proxy.name.clone(), ProxyState::Available))
            .collect();

        Ok(Self {
            proxies,
            anchors: config.proxy_anchors.clone(),
            check_period: Duration::from_secs(config.proxy_check_period_secs),
            states: RwLock::new(states),
            last_check: Mutex::new(None),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.proxies.iter().map(|proxy| proxy.name.clone()).collect()
    }

    /// Proxies currently believed available, in configured order.
    pub async fn available(&self) -> Vec<ProxyHandle> {
        let states = self.states.read().await;

        self.proxies
            .iter()
            .filter(|proxy| states.get(&proxy.name) != Some(&ProxyState::Suspended))
            .cloned()
            .collect()
    }

    /// Restores persisted availability so a fresh replica does not hammer
    /// proxies that were already known suspended.
    pub async fn restore_states(&self, pool: &PgPool) -> Result<()> {
        let persisted = get_proxy_states(pool, &self.names()).await?;
        *self.states.write().await = persisted;
        Ok(())
    }

    /// Re-probes availability if the check period elapsed. A proxy is
    /// available when any anchor answers its HEAD request.
    pub async fn refresh_if_due(&self, pool: &PgPool) -> Result<()> {
        {
            let mut last_check = self.last_check.lock().await;

            if let Some(checked_at) = *last_check {
                if checked_at.elapsed() < self.check_period {
                    return Ok(());
                }
            }

            *last_check = Some(Instant::now());
        }

        let checks = self.proxies.iter().map(|proxy| async {
            let available = is_proxy_available(proxy, &self.anchors).await;
            (proxy.name.clone(), available)
        });

        let results = join_all(checks).await;

        let mut new_states = HashMap::new();

        for (name, available) in results {
            let state = if available {
                ProxyState::Available
            } else {
                warn!(proxy = %name, "proxy_suspended");
                ProxyState::Suspended
            };
            new_states.insert(name, state);
        }

        update_proxy_states(pool, &new_states).await?;

        info!(
            available = new_states.values().filter(|s| **s == ProxyState::Available).count(),
            total = new_states.len(),
            "proxy_states_refreshed"
        );

        *self.states.write().await = new_states;

        Ok(())
    }
}

async fn check_proxy(proxy: &ProxyHandle, url: &str) -> bool {
    match proxy.client.head(url).send().await {
        Ok(response) => {
            debug!(proxy = %proxy.name, url, status = %response.status(), "proxy_check");
            response.status() == reqwest::StatusCode::OK
        }
        Err(error) => {
            debug!(proxy = %proxy.name, url, %error, "proxy_check_error");
            false
        }
    }
}

async fn is_proxy_available(proxy: &ProxyHandle, anchors: &[String]) -> bool {
    let checks = anchors.iter().map(|url| check_proxy(proxy, url));

    join_all(checks).await.into_iter().any(|ok| ok)
}

pub async fn get_proxy_states(pool: &PgPool, names: &[String]) -> Result<HashMap<String, ProxyState>> {
    let rows = sqlx::query("SELECT name, state FROM proxy_states WHERE name = ANY($1)")
        .bind(names)
        .fetch_all(pool)
        .await?;

    let mut states: HashMap<String, ProxyState> = names
        .iter()
        .map(|name| (name.clone(), ProxyState::Available))
        .collect();

    for row in rows {
        let name: String = row.try_get("name")?;
        let state: String = row.try_get("state")?;
        states.insert(name, ProxyState::parse(&state)?);
    }

    Ok(states)
}

pub async fn update_proxy_states(pool: &PgPool, states: &HashMap<String, ProxyState>) -> Result<()> {
    for (name, state) in states {
        sqlx::query(
            r#"
            INSERT INTO proxy_states (name, state, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE SET state = EXCLUDED.state, updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(state.as_str())
        .execute(pool)
        .await?;
    }

    Ok(())
}
