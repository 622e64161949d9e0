use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tracing::debug;

use crate::{
    store::ChatStore,
    types::{Usage, UsageIncrement},
};

/// Cost per 1M input tokens (USD) for models with no known price.
const DEFAULT_INPUT_COST_PER_MILLION: f64 = 5.0;
/// Cost per 1M output tokens (USD) for models with no known price.
const DEFAULT_OUTPUT_COST_PER_MILLION: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
}

impl ModelPrice {
    pub const fn new(input_cost_per_million: f64, output_cost_per_million: f64) -> Self {
        Self {
            input_cost_per_million,
            output_cost_per_million,
        }
    }

    pub fn cost(&self, usage: Usage) -> f64 {
        let input = f64::from(usage.input_tokens) / 1_000_000.0 * self.input_cost_per_million;
        let output = f64::from(usage.output_tokens) / 1_000_000.0 * self.output_cost_per_million;
        input + output
    }
}

/// Per-model prices with a per-provider fallback, then a global fallback.
#[derive(Debug, Clone)]
pub struct PriceRegistry {
    models: HashMap<String, ModelPrice>,
    providers: HashMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl Default for PriceRegistry {
    fn default() -> Self {
        let models = [
            ("gpt-4o", ModelPrice::new(2.50, 10.00)),
            ("gpt-4o-mini", ModelPrice::new(0.15, 0.60)),
            ("gpt-4-turbo", ModelPrice::new(10.00, 30.00)),
            ("claude-3.5-sonnet", ModelPrice::new(3.00, 15.00)),
            ("claude-3-opus", ModelPrice::new(15.00, 75.00)),
            ("claude-3-haiku", ModelPrice::new(0.25, 1.25)),
            ("gemini-1.5-pro", ModelPrice::new(1.25, 5.00)),
            ("gemini-1.5-flash", ModelPrice::new(0.075, 0.30)),
        ]
        .into_iter()
        .map(|(model, price)| (model.to_owned(), price))
        .collect();

        let providers = HashMap::from([("mock".to_owned(), ModelPrice::new(0.0, 0.0))]);

        Self {
            models,
            providers,
            fallback: ModelPrice::new(DEFAULT_INPUT_COST_PER_MILLION, DEFAULT_OUTPUT_COST_PER_MILLION),
        }
    }
}

impl PriceRegistry {
    pub fn with_model_price(mut self, model: &str, price: ModelPrice) -> Self {
        self.models.insert(model.to_owned(), price);
        self
    }

    pub fn with_provider_price(mut self, provider: &str, price: ModelPrice) -> Self {
        self.providers.insert(provider.to_owned(), price);
        self
    }

    /// Routed model ids such as `openai/gpt-4o-mini` fall back to their bare name.
    pub fn price_for(&self, provider: &str, model: &str) -> ModelPrice {
        let bare = model.rsplit_once('/').map(|(_, name)| name);
        self.models
            .get(model)
            .or_else(|| bare.and_then(|name| self.models.get(name)))
            .or_else(|| self.providers.get(provider))
            .copied()
            .unwrap_or(self.fallback)
    }

    pub fn cost(&self, provider: &str, model: &str, usage: Usage) -> f64 {
        self.price_for(provider, model).cost(usage)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeteredTurn {
    pub usage: Usage,
    pub cost_usd: f64,
}

/// Rolls finished turns into the daily org and org-user aggregates.
pub struct UsageMeter {
    store: Arc<dyn ChatStore>,
    prices: PriceRegistry,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn ChatStore>, prices: PriceRegistry) -> Self {
        Self { store, prices }
    }

    /// Missing provider usage counts as zero tokens. Personal conversations
    /// (no org) are not aggregated.
    pub async fn record_turn(
        &self,
        org_id: Option<&str>,
        user_id: &str,
        provider: &str,
        model: &str,
        feature: &str,
        usage: Option<Usage>,
    ) -> anyhow::Result<Option<MeteredTurn>> {
        let Some(org_id) = org_id else {
            return Ok(None);
        };

        let usage = usage.unwrap_or_default();
        let cost_usd = self.prices.cost(provider, model, usage);

        self.store
            .increment_usage(UsageIncrement {
                org_id: org_id.to_owned(),
                user_id: user_id.to_owned(),
                date: Utc::now().date_naive(),
                provider: provider.to_owned(),
                model: model.to_owned(),
                feature: feature.to_owned(),
                input_tokens: u64::from(usage.input_tokens),
                output_tokens: u64::from(usage.output_tokens),
                cost_usd,
            })
            .await?;

        debug!(
            org_id = %org_id,
            user_id = %user_id,
            model = %model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost_usd,
            "turn usage recorded"
        );

        Ok(Some(MeteredTurn { usage, cost_usd }))
    }
}
