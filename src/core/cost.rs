//! Per-call usage/cost roll-up and budget enforcement.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised before a backend call would push spend past the budget.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{reason}")]
pub struct BudgetExceeded {
    pub reason: String,
}

/// Normalized token usage for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Fill in `total_tokens` when the provider reported only the parts.
    pub fn normalized(mut self) -> Self {
        if self.total_tokens == 0 && (self.prompt_tokens > 0 || self.completion_tokens > 0) {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
        self
    }

    pub fn add(self, other: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }
}

/// Normalized cost estimate for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub currency: String,
    pub amount: f64,
    pub is_estimate: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pricing_model: String,
}

impl Cost {
    pub fn usd() -> Self {
        Self {
            currency: "USD".to_string(),
            ..Self::default()
        }
    }
}

/// Metadata for one backend call (including failed attempts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReport {
    pub adapter: String,
    pub model: String,
    pub usage: Usage,
    pub cost: Cost,
    pub retries: u32,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Per-1k-token pricing for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

/// adapter name -> model name (or "default") -> pricing.
pub type PricingTable = HashMap<String, HashMap<String, ModelPricing>>;

/// Budget enforcement state written into the run record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub max_amount: f64,
    pub exceeded: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Aggregated cost/usage for a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCostReport {
    pub currency: String,
    pub total_amount: f64,
    pub total_usage: Usage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<CallReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetStatus>,
}

/// Accumulates call reports and enforces the run budget.
///
/// Enforcement is disabled when `max_budget_usd` is zero. Projection uses
/// the previous successful call's usage as a hint for the next call.
#[derive(Debug, Clone, Default)]
pub struct CostTracker {
    pricing: PricingTable,
    total_usage: Usage,
    total_amount: f64,
    calls: Vec<CallReport>,
    max_budget_usd: f64,
    budget_status: Option<BudgetStatus>,
    last_usage_hint: Option<Usage>,
}

impl CostTracker {
    pub fn new(pricing: PricingTable, max_budget_usd: f64) -> Self {
        Self {
            pricing,
            max_budget_usd,
            ..Self::default()
        }
    }

    /// Check the budget before a call to `adapter`/`model`.
    pub fn check_budget(&mut self, adapter: &str, model: &str) -> Result<(), BudgetExceeded> {
        if self.max_budget_usd <= 0.0 {
            return Ok(());
        }
        let max_budget = self.max_budget_usd;
        let status = self.budget_status.get_or_insert_with(|| BudgetStatus {
            max_amount: max_budget,
            ..BudgetStatus::default()
        });

        if self.total_amount >= self.max_budget_usd {
            let reason = format!(
                "budget {:.2} exceeded (current total {:.2})",
                self.max_budget_usd, self.total_amount
            );
            status.exceeded = true;
            status.reason = reason.clone();
            return Err(BudgetExceeded { reason });
        }

        let Some(hint) = self.last_usage_hint else {
            return Ok(());
        };
        let Some(cost) = estimate_cost(&self.pricing, adapter, model, hint) else {
            return Ok(());
        };
        let projected = self.total_amount + cost.amount;
        if projected > self.max_budget_usd {
            let reason = format!(
                "budget {:.2} exceeded (projected total {:.2})",
                self.max_budget_usd, projected
            );
            status.exceeded = true;
            status.reason = reason.clone();
            return Err(BudgetExceeded { reason });
        }
        Ok(())
    }

    /// Record reports from one backend call chain; failed attempts keep
    /// their error string and do not contribute cost or usage.
    pub fn record_reports(&mut self, reports: &[CallReport]) {
        for report in reports {
            self.calls.push(report.clone());
            if !report.error.is_empty() {
                continue;
            }
            self.total_amount += report.cost.amount;
            self.total_usage = self.total_usage.add(report.usage);
            self.last_usage_hint = Some(report.usage);
        }
    }

    pub fn estimate(&self, adapter: &str, model: &str, usage: Usage) -> Cost {
        estimate_cost(&self.pricing, adapter, model, usage).unwrap_or_else(Cost::usd)
    }

    pub fn report(&self) -> RunCostReport {
        let mut budget = self.budget_status.clone();
        if budget.is_none() && self.max_budget_usd > 0.0 {
            budget = Some(BudgetStatus {
                max_amount: self.max_budget_usd,
                ..BudgetStatus::default()
            });
        }
        RunCostReport {
            currency: "USD".to_string(),
            total_amount: self.total_amount,
            total_usage: self.total_usage,
            calls: self.calls.clone(),
            budget,
        }
    }
}

fn estimate_cost(
    pricing: &PricingTable,
    adapter: &str,
    model: &str,
    usage: Usage,
) -> Option<Cost> {
    let entry = pricing_for(pricing, adapter, model)?;
    let prompt_cost = (usage.prompt_tokens as f64 / 1000.0) * entry.prompt_per_1k;
    let completion_cost = (usage.completion_tokens as f64 / 1000.0) * entry.completion_per_1k;
    Some(Cost {
        currency: "USD".to_string(),
        amount: prompt_cost + completion_cost,
        is_estimate: true,
        pricing_model: "per_1k_tokens".to_string(),
    })
}

fn pricing_for(pricing: &PricingTable, adapter: &str, model: &str) -> Option<ModelPricing> {
    let adapter_pricing = pricing.get(adapter)?;
    adapter_pricing
        .get(model)
        .or_else(|| adapter_pricing.get("default"))
        .copied()
}
