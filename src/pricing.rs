//! Tool-call pricing.
//!
//! Pricing is a pure function from (tool name, arguments) to a non-negative
//! credit price. The dynamic-pricing rule engine lives outside this crate;
//! the table here covers per-tool overrides on the prefixed public name plus
//! a default, which is what the admission pipeline needs.

use std::collections::HashMap;

use serde_json::Value;

pub const DEFAULT_PRICE: u64 = 1;

#[derive(Debug, Clone)]
pub struct PricingTable {
    default_price: u64,
    /// Overrides keyed by the prefixed public tool name (`"fs:read_file"`).
    tools: HashMap<String, u64>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(DEFAULT_PRICE, HashMap::new())
    }
}

impl PricingTable {
    pub fn new(default_price: u64, tools: HashMap<String, u64>) -> Self {
        Self {
            default_price,
            tools,
        }
    }

    /// Price for one call. `_arguments` is part of the contract so richer
    /// pricing collaborators can slot in without touching the gate.
    pub fn resolve(&self, tool: &str, _arguments: &Value) -> u64 {
        self.tools.get(tool).copied().unwrap_or(self.default_price)
    }
}
