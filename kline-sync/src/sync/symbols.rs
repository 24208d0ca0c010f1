//! Reconciles stored symbol metadata with the exchange listing.

use crate::errors::Result;
use crate::exchange::ExchangeClient;
use crate::models::Symbol;
use crate::store::CandleStore;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SymbolSyncReport {
    pub added: usize,
    pub updated: usize,
    pub deactivated: usize,
    pub unchanged: usize,
}

impl SymbolSyncReport {
    pub fn writes(&self) -> usize {
        self.added + self.updated + self.deactivated
    }
}

/// Whether `symbol` quotes in `quote` (case-insensitive); `None` matches all.
pub fn quote_matches(symbol: &Symbol, quote: Option<&str>) -> bool {
    quote.map_or(true, |q| symbol.quote.eq_ignore_ascii_case(q))
}

/// Rows to write so the stored set mirrors `listed`, plus what changed.
///
/// Only tradable listed markets count as present. A listing without a
/// listing time keeps the stored one.
pub fn reconcile(listed: &[Symbol], stored: &[Symbol]) -> (Vec<Symbol>, SymbolSyncReport) {
    let stored_by_id: BTreeMap<&str, &Symbol> = stored.iter().map(|s| (s.symbol.as_str(), s)).collect();
    let mut report = SymbolSyncReport::default();
    let mut writes = Vec::new();
    let mut seen = HashSet::new();

    for listing in listed.iter().filter(|s| s.active) {
        if !seen.insert(listing.symbol.as_str()) {
            continue;
        }
        match stored_by_id.get(listing.symbol.as_str()) {
            None => {
                report.added += 1;
                writes.push(listing.clone());
            }
            Some(current) => {
                let merged = Symbol {
                    listed_at: listing.listed_at.or(current.listed_at),
                    ..listing.clone()
                };
                if &merged == *current {
                    report.unchanged += 1;
                } else {
                    report.updated += 1;
                    writes.push(merged);
                }
            }
        }
    }

    for current in stored.iter().filter(|s| !seen.contains(s.symbol.as_str())) {
        if current.active {
            report.deactivated += 1;
            writes.push(current.deactivated());
        } else {
            report.unchanged += 1;
        }
    }

    (writes, report)
}

pub struct SymbolSyncer {
    client: Arc<ExchangeClient>,
    store: Arc<dyn CandleStore>,
    quote_filter: Option<String>,
}

impl SymbolSyncer {
    pub fn new(client: Arc<ExchangeClient>, store: Arc<dyn CandleStore>, quote_filter: Option<String>) -> Self {
        Self {
            client,
            store,
            quote_filter,
        }
    }

    /// List markets, diff against the store and write only what changed.
    pub async fn sync(&self) -> Result<SymbolSyncReport> {
        let exchange = self.client.id().to_string();
        let quote = self.quote_filter.as_deref();

        let listed: Vec<Symbol> = self
            .client
            .list_markets()
            .await?
            .into_iter()
            .filter(|s| quote_matches(s, quote))
            .map(|s| Symbol {
                exchange: exchange.clone(),
                ..s
            })
            .collect();

        let stored: Vec<Symbol> = self
            .store
            .list_symbols(&exchange)
            .await?
            .into_iter()
            .filter(|s| quote_matches(s, quote))
            .collect();

        let (writes, report) = reconcile(&listed, &stored);
        if !writes.is_empty() {
            self.store.upsert_symbols(&writes).await?;
        }

        info!(
            "{} symbols: {} added, {} updated, {} deactivated, {} unchanged",
            exchange, report.added, report.updated, report.deactivated, report.unchanged
        );
        Ok(report)
    }
}
