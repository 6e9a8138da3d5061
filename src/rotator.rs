use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use crate::provider::{KeyStatus, LlmConfiguration, LlmProvider, ProviderInterface};
use crate::resources::{self, KIND_TOKENS_COST};
use crate::types::{CostPoints, Error, Result};
use crate::user_settings;
use crate::feeds;

// This code is not about billing. It protects keys from overuse: when in
// doubt, a key is debited with its worst-case reserved cost.

/// Everything known about one subscriber's key before selection.
#[derive(Debug, Clone)]
pub struct UserKeyInfo {
    pub user_id: Uuid,
    pub api_key: Option<String>,
    pub max_cost_in_month: CostPoints,
    pub process_entries_not_older_than: Duration,
    pub cost_used: CostPoints,
}

#[derive(Debug, Clone)]
pub struct SelectKeyContext {
    pub feed_ids: Vec<Uuid>,
    pub entry_age: Duration,
    pub reserved_cost: CostPoints,
    pub interval_started_at: DateTime<Utc>,
    pub collections_api_key: Option<String>,
    pub general_api_key: Option<String>,
}

/// A selected credential with its reservation. `used_cost` stays empty
/// until the caller reports actual spend; until then the full reservation
/// is what gets debited.
#[derive(Debug, Clone)]
pub struct ApiKeyUsage {
    pub provider: LlmProvider,
    pub user_id: Option<Uuid>,
    pub api_key: String,
    pub reserved_cost: CostPoints,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub used_cost: Option<CostPoints>,
    pub interval_started_at: DateTime<Utc>,
}

impl ApiKeyUsage {
    fn shared(provider: LlmProvider, api_key: String, context: &SelectKeyContext) -> Self {
        Self {
            provider,
            user_id: None,
            api_key,
            reserved_cost: context.reserved_cost,
            input_tokens: None,
            output_tokens: None,
            used_cost: None,
            interval_started_at: context.interval_started_at,
        }
    }

    pub fn register_spend(&mut self, report: &SpendReport) {
        self.input_tokens = Some(report.input_tokens);
        self.output_tokens = Some(report.output_tokens);
        self.used_cost = Some(report.used_cost);
    }

    /// What to debit: actual spend when recorded, the full reservation
    /// otherwise (the conservative fallback for crashed calls).
    pub fn cost_to_register(&self) -> CostPoints {
        self.used_cost.unwrap_or(self.reserved_cost)
    }
}

/// Actual spend of a completed call. Returned by the work running under
/// `use_api_key`, so a successful call cannot forget to report it.
#[derive(Debug, Clone, Copy)]
pub struct SpendReport {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub used_cost: CostPoints,
}

/// Storage surface key rotation depends on. A trait seam so the selection
/// logic is testable without Postgres; the database implementation is the
/// source of truth for reservations.
#[async_trait]
pub trait RotationStore: Send + Sync {
    async fn feed_ids_for_source(&self, source_id: Uuid) -> Result<Vec<Uuid>>;

    async fn any_feed_in_collection(&self, feed_ids: &[Uuid]) -> Result<bool>;

    async fn linked_user_ids(&self, feed_ids: &[Uuid]) -> Result<Vec<Uuid>>;

    async fn load_user_key_infos(
        &self,
        provider: LlmProvider,
        user_ids: &[Uuid],
        interval_started_at: DateTime<Utc>,
    ) -> Result<Vec<UserKeyInfo>>;

    async fn try_to_reserve(
        &self,
        user_id: Uuid,
        interval_started_at: DateTime<Utc>,
        amount: CostPoints,
        limit: CostPoints,
    ) -> Result<bool>;

    async fn convert_reserved_to_used(
        &self,
        user_id: Uuid,
        interval_started_at: DateTime<Utc>,
        used: CostPoints,
        reserved: CostPoints,
    ) -> Result<()>;
}

pub struct PgRotationStore {
    pool: PgPool,
}

impl PgRotationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RotationStore for PgRotationStore {
    async fn feed_ids_for_source(&self, source_id: Uuid) -> Result<Vec<Uuid>> {
        feeds::feed_ids_for_source(&self.pool, source_id).await
    }

    async fn any_feed_in_collection(&self, feed_ids: &[Uuid]) -> Result<bool> {
        feeds::any_feed_in_collection(&self.pool, feed_ids).await
    }

    async fn linked_user_ids(&self, feed_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        feeds::linked_user_ids(&self.pool, feed_ids).await
    }

    async fn load_user_key_infos(
        &self,
        provider: LlmProvider,
        user_ids: &[Uuid],
        interval_started_at: DateTime<Utc>,
    ) -> Result<Vec<UserKeyInfo>> {
        let settings = user_settings::load_for_users(&self.pool, provider, user_ids).await?;

        let ledger = resources::load_resources(&self.pool, user_ids, KIND_TOKENS_COST, interval_started_at).await?;

        let mut infos = Vec::new();

        for setting in settings {
            let cost_used = ledger
                .get(&setting.user_id)
                .map(|resource| resource.total())
                .unwrap_or_default();

            infos.push(UserKeyInfo {
                user_id: setting.user_id,
                api_key: setting.api_key,
                max_cost_in_month: setting.max_cost_in_month,
                process_entries_not_older_than: setting.process_entries_not_older_than,
                cost_used,
            });
        }

        Ok(infos)
    }

    async fn try_to_reserve(
        &self,
        user_id: Uuid,
        interval_started_at: DateTime<Utc>,
        amount: CostPoints,
        limit: CostPoints,
    ) -> Result<bool> {
        resources::try_to_reserve(&self.pool, user_id, KIND_TOKENS_COST, interval_started_at, amount, limit).await
    }

    async fn convert_reserved_to_used(
        &self,
        user_id: Uuid,
        interval_started_at: DateTime<Utc>,
        used: CostPoints,
        reserved: CostPoints,
    ) -> Result<()> {
        resources::convert_reserved_to_used(
            &self.pool,
            user_id,
            KIND_TOKENS_COST,
            interval_started_at,
            used,
            reserved,
        )
        .await
    }
}

// Candidate filtering. Each filter is pure over the candidate list, so the
// whole pipeline is unit-testable.

pub fn filter_out_users_without_keys(infos: Vec<UserKeyInfo>) -> Vec<UserKeyInfo> {
    infos.into_iter().filter(|info| info.api_key.is_some()).collect()
}

pub fn filter_out_users_for_whom_entry_is_too_old(infos: Vec<UserKeyInfo>, entry_age: Duration) -> Vec<UserKeyInfo> {
    infos
        .into_iter()
        .filter(|info| info.process_entries_not_older_than >= entry_age)
        .collect()
}

pub fn filter_out_users_with_overused_keys(infos: Vec<UserKeyInfo>, reserved_cost: CostPoints) -> Vec<UserKeyInfo> {
    infos
        .into_iter()
        .filter(|info| info.cost_used.saturating_add(reserved_cost) < info.max_cost_in_month)
        .collect()
}

async fn api_key_is_working(provider: &dyn ProviderInterface, config: &LlmConfiguration, api_key: &str) -> bool {
    match provider.key_statuses().get(api_key) {
        KeyStatus::Works => true,
        KeyStatus::Broken | KeyStatus::Quota => false,
        KeyStatus::Unknown => provider.check_api_key(config, api_key).await == KeyStatus::Works,
    }
}

pub async fn filter_out_users_with_wrong_keys(
    provider: &dyn ProviderInterface,
    config: &LlmConfiguration,
    infos: Vec<UserKeyInfo>,
) -> Vec<UserKeyInfo> {
    let mut working = Vec::new();

    for info in infos {
        let Some(api_key) = info.api_key.as_deref() else {
            continue;
        };

        if api_key_is_working(provider, config, api_key).await {
            working.push(info);
        }
    }

    working
}

async fn get_candidates(
    store: &dyn RotationStore,
    provider: &dyn ProviderInterface,
    config: &LlmConfiguration,
    context: &SelectKeyContext,
) -> Result<Vec<UserKeyInfo>> {
    let user_ids = store.linked_user_ids(&context.feed_ids).await?;

    let infos = store
        .load_user_key_infos(provider.provider(), &user_ids, context.interval_started_at)
        .await?;

    let infos = filter_out_users_without_keys(infos);
    let infos = filter_out_users_for_whom_entry_is_too_old(infos, context.entry_age);
    let infos = filter_out_users_with_wrong_keys(provider, config, infos).await;
    let infos = filter_out_users_with_overused_keys(infos, context.reserved_cost);

    Ok(infos)
}

/// Reserves against the least-used surviving candidate; when the
/// reservation race is lost (another caller drained the budget first),
/// falls through to the next least-used one.
async fn choose_user(
    store: &dyn RotationStore,
    infos: &[UserKeyInfo],
    reserved_cost: CostPoints,
    interval_started_at: DateTime<Utc>,
) -> Result<Option<UserKeyInfo>> {
    for info in infos {
        let reserved = store
            .try_to_reserve(info.user_id, interval_started_at, reserved_cost, info.max_cost_in_month)
            .await?;

        if reserved {
            return Ok(Some(info.clone()));
        }
    }

    Ok(None)
}

async fn find_best_user_with_key(
    store: &dyn RotationStore,
    provider: &dyn ProviderInterface,
    config: &LlmConfiguration,
    context: &SelectKeyContext,
) -> Result<Option<UserKeyInfo>> {
    let mut infos = get_candidates(store, provider, config, context).await?;

    infos.sort_by_key(|info| info.cost_used);

    choose_user(store, &infos, context.reserved_cost, context.interval_started_at).await
}

async fn choose_collections_key(
    store: &dyn RotationStore,
    provider: &dyn ProviderInterface,
    context: &SelectKeyContext,
) -> Result<Option<ApiKeyUsage>> {
    let Some(key) = context.collections_api_key.clone() else {
        return Ok(None);
    };

    if !store.any_feed_in_collection(&context.feed_ids).await? {
        return Ok(None);
    }

    Ok(Some(ApiKeyUsage::shared(provider.provider(), key, context)))
}

async fn choose_general_key(
    provider: &dyn ProviderInterface,
    context: &SelectKeyContext,
) -> Result<Option<ApiKeyUsage>> {
    let Some(key) = context.general_api_key.clone() else {
        return Ok(None);
    };

    Ok(Some(ApiKeyUsage::shared(provider.provider(), key, context)))
}

async fn choose_user_key(
    store: &dyn RotationStore,
    provider: &dyn ProviderInterface,
    config: &LlmConfiguration,
    context: &SelectKeyContext,
) -> Result<Option<ApiKeyUsage>> {
    // Hard invariant: subscribers never pay for collection feeds. Reaching
    // this selector with a collection feed is a bug upstream, not a case to
    // skip quietly.
    if store.any_feed_in_collection(&context.feed_ids).await? {
        return Err(Error::UserKeyForCollectionFeed);
    }

    let Some(info) = find_best_user_with_key(store, provider, config, context).await? else {
        return Ok(None);
    };

    let api_key = info
        .api_key
        .clone()
        .ok_or_else(|| Error::General("selected a candidate without an api key".to_string()))?;

    Ok(Some(ApiKeyUsage {
        provider: provider.provider(),
        user_id: Some(info.user_id),
        api_key,
        reserved_cost: context.reserved_cost,
        input_tokens: None,
        output_tokens: None,
        used_cost: None,
        interval_started_at: context.interval_started_at,
    }))
}

/// Selects the credential that pays for a call, in fixed priority order:
/// collections key, then the operator-wide general key, then the best
/// subscriber key. The collections key outranks the general key so an
/// operator can fund collections without also funding every subscriber.
pub async fn choose_api_key(
    store: &dyn RotationStore,
    provider: &dyn ProviderInterface,
    config: &LlmConfiguration,
    context: &SelectKeyContext,
) -> Result<Option<ApiKeyUsage>> {
    if let Some(usage) = choose_collections_key(store, provider, context).await? {
        return Ok(Some(usage));
    }

    if let Some(usage) = choose_general_key(provider, context).await? {
        return Ok(Some(usage));
    }

    choose_user_key(store, provider, config, context).await
}

/// Runs `work` under the selected key. Whatever happens inside, the
/// reservation is converted exactly once: into the reported spend on
/// success, into the full reserved cost on failure. Spend reporting is part
/// of the work's return type, so a successful call cannot skip it.
pub async fn use_api_key<T, Fut>(store: &dyn RotationStore, usage: &mut ApiKeyUsage, work: Fut) -> Result<T>
where
    Fut: Future<Output = Result<(T, SpendReport)>>,
{
    let result = work.await;

    if let Ok((_, report)) = &result {
        usage.register_spend(report);
    }

    if let Some(user_id) = usage.user_id {
        let conversion = store
            .convert_reserved_to_used(
                user_id,
                usage.interval_started_at,
                usage.cost_to_register(),
                usage.reserved_cost,
            )
            .await;

        info!(
            user_id = %user_id,
            reserved = usage.reserved_cost.0,
            used = usage.cost_to_register().0,
            "convert_reserved_to_used"
        );

        match conversion {
            Ok(()) => {}
            Err(conversion_error) => {
                error!(user_id = %user_id, %conversion_error, "reservation_conversion_failed");

                // A failed call keeps its own error; a successful call must
                // not pretend the ledger is consistent.
                if result.is_ok() {
                    return Err(conversion_error);
                }
            }
        }
    }

    result.map(|(value, _)| value)
}
