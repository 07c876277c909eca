//! Strategy registry.
//!
//! Immutable catalogue of validated strategy definitions plus the
//! table ↔ strategy bindings, which can be added and removed independently
//! of the definitions themselves.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::StrategyDefinition;
use crate::types::{EngineError, StrategyKey, TableId};

/// A registered definition with its declaration order.
#[derive(Debug, Clone)]
pub struct RegisteredStrategy {
    pub definition: Arc<StrategyDefinition>,
    /// Registration sequence, used as the final conflict tie-break.
    pub declaration_order: u64,
}

/// Summary of the registry for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub total_strategies: usize,
    pub total_tables: usize,
    pub bindings: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<StrategyKey, RegisteredStrategy>,
    /// Bindings per table, in attach order.
    bindings: HashMap<TableId, Vec<StrategyKey>>,
    next_order: u64,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition, binding it to its declared tables.
    pub fn register(&mut self, definition: StrategyDefinition) -> Result<Arc<StrategyDefinition>, EngineError> {
        definition.validate()?;
        if self.strategies.contains_key(&definition.key) {
            return Err(EngineError::DuplicateStrategy(definition.key.clone()));
        }

        let key = definition.key.clone();
        let tables = definition.tables.clone();
        let definition = Arc::new(definition);
        self.strategies.insert(
            key.clone(),
            RegisteredStrategy {
                definition: Arc::clone(&definition),
                declaration_order: self.next_order,
            },
        );
        self.next_order += 1;

        for table in tables {
            self.bind(&table, &key)?;
        }

        info!(
            strategy = %key,
            pattern = %crate::types::format_outcomes(&definition.entry.pattern),
            target = %definition.entry.target,
            layers = definition.staking.layer_count(),
            "Strategy registered"
        );
        Ok(definition)
    }

    /// Remove a strategy and every binding that references it.
    pub fn unregister(&mut self, key: &StrategyKey) -> bool {
        if self.strategies.remove(key).is_none() {
            return false;
        }
        self.bindings.retain(|_, keys| {
            keys.retain(|k| k != key);
            !keys.is_empty()
        });
        info!(strategy = %key, "Strategy unregistered");
        true
    }

    /// Bind a registered strategy to a table. Idempotent.
    pub fn bind(&mut self, table: &TableId, key: &StrategyKey) -> Result<(), EngineError> {
        if !self.strategies.contains_key(key) {
            return Err(EngineError::UnknownStrategy(key.clone()));
        }
        let keys = self.bindings.entry(table.clone()).or_default();
        if !keys.contains(key) {
            keys.push(key.clone());
            debug!(table = %table, strategy = %key, "Strategy bound to table");
        }
        Ok(())
    }

    /// Remove one binding. Returns false when it did not exist.
    pub fn unbind(&mut self, table: &TableId, key: &StrategyKey) -> bool {
        let Some(keys) = self.bindings.get_mut(table) else {
            return false;
        };
        let before = keys.len();
        keys.retain(|k| k != key);
        let removed = keys.len() != before;
        if keys.is_empty() {
            self.bindings.remove(table);
        }
        removed
    }

    /// Remove every binding of a table. Returns how many were removed.
    pub fn detach_all(&mut self, table: &TableId) -> usize {
        self.bindings.remove(table).map_or(0, |keys| keys.len())
    }

    pub fn get(&self, key: &StrategyKey) -> Option<&RegisteredStrategy> {
        self.strategies.get(key)
    }

    pub fn contains(&self, key: &StrategyKey) -> bool {
        self.strategies.contains_key(key)
    }

    pub fn is_bound(&self, table: &TableId, key: &StrategyKey) -> bool {
        self.bindings.get(table).is_some_and(|keys| keys.contains(key))
    }

    /// Strategies bound to a table, in binding order.
    pub fn strategies_for(&self, table: &TableId) -> Vec<RegisteredStrategy> {
        self.bindings
            .get(table)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.strategies.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tables a strategy is bound to, sorted.
    pub fn tables_for(&self, key: &StrategyKey) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self
            .bindings
            .iter()
            .filter(|(_, keys)| keys.contains(key))
            .map(|(table, _)| table.clone())
            .collect();
        tables.sort();
        tables
    }

    /// All strategy keys in declaration order.
    pub fn keys(&self) -> Vec<StrategyKey> {
        let mut entries: Vec<_> = self.strategies.iter().collect();
        entries.sort_by_key(|(_, r)| r.declaration_order);
        entries.into_iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            total_strategies: self.strategies.len(),
            total_tables: self.bindings.len(),
            bindings: self
                .bindings
                .iter()
                .map(|(t, keys)| {
                    (
                        t.to_string(),
                        keys.iter().map(|k| k.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
