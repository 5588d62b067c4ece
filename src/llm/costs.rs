//! Per-model pricing in quota coins.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;

/// Built-in prices, in coins per 1K tokens.
const DEFAULT_PRICES: &[(&str, Decimal)] = &[
    ("gpt-3.5-turbo", dec!(3)),
    ("gpt-3.5-turbo-16k", dec!(5)),
    ("gpt-4", dec!(60)),
    ("gpt-4-32k", dec!(120)),
    ("gpt-4-turbo", dec!(30)),
    ("gpt-4o", dec!(15)),
    ("gpt-4o-mini", dec!(1)),
];

/// Price charged for models missing from the table.
const FALLBACK_PRICE: Decimal = dec!(10);

/// Model pricing and billing-model resolution.
#[derive(Debug, Clone)]
pub struct CostTable {
    prices: HashMap<String, Decimal>,
    fallback: Decimal,
    aliases: HashMap<String, String>,
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            prices: DEFAULT_PRICES
                .iter()
                .map(|(model, price)| (model.to_string(), *price))
                .collect(),
            fallback: FALLBACK_PRICE,
            aliases: HashMap::new(),
        }
    }
}

impl CostTable {
    /// Built-in prices with the given billing aliases.
    pub fn with_aliases(aliases: HashMap<String, String>) -> Self {
        Self {
            aliases,
            ..Default::default()
        }
    }

    /// Override the price of one model.
    pub fn with_price(mut self, model: impl Into<String>, per_1k_tokens: Decimal) -> Self {
        self.prices.insert(model.into(), per_1k_tokens);
        self
    }

    /// Map a requested model to the model it is billed as.
    ///
    /// Configured aliases win; otherwise a `provider:` prefix is stripped.
    pub fn resolve_billing_model(&self, model: &str) -> String {
        if let Some(alias) = self.aliases.get(model) {
            return alias.clone();
        }
        match model.split_once(':') {
            Some((_, bare)) if !bare.is_empty() => bare.to_string(),
            _ => model.to_string(),
        }
    }

    /// Coins per 1K tokens for `model`.
    pub fn price(&self, model: &str) -> Decimal {
        self.prices.get(model).copied().unwrap_or(self.fallback)
    }

    /// Quota cost of `tokens` tokens on `model`, rounded up to whole coins.
    pub fn cost_for_tokens(&self, model: &str, tokens: i64) -> i64 {
        if tokens <= 0 {
            return 0;
        }
        let cost = Decimal::from(tokens) / dec!(1000) * self.price(model);
        cost.ceil().to_i64().unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_whole_coins() {
        let table = CostTable::default();
        assert_eq!(table.cost_for_tokens("gpt-4", 1000), 60);
        assert_eq!(table.cost_for_tokens("gpt-4", 1), 1);
        assert_eq!(table.cost_for_tokens("gpt-3.5-turbo", 500), 2);
        assert_eq!(table.cost_for_tokens("gpt-4", 0), 0);
    }

    #[test]
    fn unknown_model_uses_fallback_price() {
        let table = CostTable::default();
        assert_eq!(table.cost_for_tokens("homebrew-7b", 1000), 10);
    }

    #[test]
    fn aliases_resolve_before_lookup() {
        let aliases = HashMap::from([("house-model".to_string(), "gpt-4o-mini".to_string())]);
        let table = CostTable::with_aliases(aliases);
        assert_eq!(table.resolve_billing_model("house-model"), "gpt-4o-mini");
        assert_eq!(table.resolve_billing_model("openai:gpt-4"), "gpt-4");
        assert_eq!(table.resolve_billing_model("gpt-4"), "gpt-4");

        let billed = table.resolve_billing_model("house-model");
        assert_eq!(table.cost_for_tokens(&billed, 2000), 2);
    }

    #[test]
    fn price_override() {
        let table = CostTable::default().with_price("gpt-4", dec!(1.5));
        assert_eq!(table.cost_for_tokens("gpt-4", 1000), 2);
    }
}
