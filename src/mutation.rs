//! Mutation engine.
//!
//! Applies a local write optimistically, gives subscribers immediate
//! feedback, then reconciles with the authoritative result. On success the
//! affected keys are invalidated so the optimistic guess is replaced by a
//! refetched server value; on failure every affected key is rolled back to
//! its pre-mutation snapshot and the failure propagates to the caller.
//!
//! Concurrent mutations touching the same key are last-writer-wins: the
//! second mutation snapshots state that already contains the first one's
//! optimistic write, so its rollback restores that optimistic state rather
//! than the true pre-mutation value. Serializing conflicting mutations is
//! the caller's responsibility.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{InvalidationBus, InvalidationEvent};
use crate::entry::EntrySnapshot;
use crate::error::MutationError;
use crate::fetcher::Mutator;
use crate::key::QueryKey;
use crate::store::CacheStore;

const METRIC_MUTATION_TOTAL: &str = "refresco_mutation_total";
const METRIC_ROLLBACK_TOTAL: &str = "refresco_mutation_rollback_total";

/// Computes the optimistic value for one key from its current value and the
/// mutation variables.
pub type ProjectFn = Arc<dyn Fn(Option<&Value>, &Value) -> Value + Send + Sync>;

/// Static description of one mutation's cache footprint.
#[derive(Clone)]
pub struct MutationConfig {
    /// Keys the optimistic projection touches; also the invalidation and
    /// rollback set. Must be non-empty.
    pub affected_keys: Vec<QueryKey>,
    pub project: ProjectFn,
}

impl MutationConfig {
    pub fn new(affected_keys: Vec<QueryKey>, project: ProjectFn) -> Self {
        Self {
            affected_keys,
            project,
        }
    }
}

/// State of one mutation call, alive from the optimistic apply until the
/// mutation settles.
struct MutationContext {
    id: Uuid,
    variables: Value,
    affected_keys: Vec<QueryKey>,
    previous: HashMap<QueryKey, EntrySnapshot>,
    started_at: OffsetDateTime,
}

/// Returned by a settled, successful mutation.
#[derive(Debug)]
pub struct MutationReceipt {
    pub id: Uuid,
    /// Value the data service confirmed.
    pub confirmed: Value,
    pub started_at: OffsetDateTime,
    pub invalidations: Vec<InvalidationEvent>,
}

pub struct MutationEngine {
    store: Arc<CacheStore>,
    bus: Arc<InvalidationBus>,
}

impl MutationEngine {
    pub fn new(store: Arc<CacheStore>, bus: Arc<InvalidationBus>) -> Self {
        Self { store, bus }
    }

    /// Run one optimistic mutation to settlement.
    ///
    /// The optimistic projection is applied and visible to every subscriber
    /// before the mutator is even dispatched; the await only covers the
    /// mutator call and the reconciliation that follows it.
    pub async fn mutate(
        &self,
        mutator: Arc<dyn Mutator>,
        variables: Value,
        config: &MutationConfig,
    ) -> Result<MutationReceipt, MutationError> {
        if config.affected_keys.is_empty() {
            return Err(MutationError::NoAffectedKeys);
        }

        let context = self.apply_optimistic(variables, config);
        info!(
            mutation_id = %context.id,
            affected = context.affected_keys.len(),
            "optimistic write applied"
        );

        match mutator.execute(&context.variables).await {
            Ok(confirmed) => {
                let invalidations = self.bus.invalidate(&context.affected_keys).await;
                counter!(METRIC_MUTATION_TOTAL).increment(1);
                Ok(MutationReceipt {
                    id: context.id,
                    confirmed,
                    started_at: context.started_at,
                    invalidations,
                })
            }
            Err(source) => {
                self.rollback(&context);
                counter!(METRIC_ROLLBACK_TOTAL).increment(1);
                warn!(mutation_id = %context.id, %source, "mutation rolled back");
                Err(MutationError::Execution { source })
            }
        }
    }

    /// Snapshot every affected key, then write its projected value. Fully
    /// synchronous, so no subscriber can observe a half-applied mutation.
    fn apply_optimistic(&self, variables: Value, config: &MutationConfig) -> MutationContext {
        let mut previous = HashMap::with_capacity(config.affected_keys.len());
        for key in &config.affected_keys {
            previous.insert(key.clone(), self.store.snapshot(key));
        }

        for key in &config.affected_keys {
            let current = self.store.get(key).and_then(|entry| entry.value);
            let projected = (config.project)(current.as_deref(), &variables);
            self.store.set(key, projected);
        }

        MutationContext {
            id: Uuid::new_v4(),
            variables,
            affected_keys: config.affected_keys.clone(),
            previous,
            started_at: OffsetDateTime::now_utc(),
        }
    }

    fn rollback(&self, context: &MutationContext) {
        for key in &context.affected_keys {
            if let Some(snapshot) = context.previous.get(key) {
                self.store.restore(key, snapshot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::CacheConfig;
    use crate::entry::EntryStatus;
    use crate::error::FetchError;
    use crate::fetcher::FnMutator;
    use crate::key::namespace;
    use crate::query::QueryEngine;

    struct Fixture {
        store: Arc<CacheStore>,
        engine: MutationEngine,
    }

    fn fixture() -> Fixture {
        let config = CacheConfig::default();
        let store = Arc::new(CacheStore::new(&config));
        let query = Arc::new(QueryEngine::new(
            Arc::clone(&store),
            config.default_stale_time(),
        ));
        let bus = Arc::new(InvalidationBus::new(Arc::clone(&store), query));
        let engine = MutationEngine::new(Arc::clone(&store), bus);
        Fixture { store, engine }
    }

    fn add_funds_config() -> MutationConfig {
        MutationConfig::new(
            vec![namespace::bancos()],
            Arc::new(|old: Option<&Value>, variables: &Value| {
                let capital = old
                    .and_then(|value| value["capitalActual"].as_i64())
                    .unwrap_or(0);
                let amount = variables["amount"].as_i64().unwrap_or(0);
                json!({ "capitalActual": capital + amount })
            }),
        )
    }

    #[tokio::test]
    async fn empty_affected_keys_fails_fast() {
        let fx = fixture();
        let config = MutationConfig::new(Vec::new(), Arc::new(|_, v: &Value| v.clone()));
        let mutator: Arc<dyn Mutator> = Arc::new(FnMutator::new(|v: Value| async move { Ok(v) }));

        let err = fx
            .engine
            .mutate(mutator, json!({}), &config)
            .await
            .expect_err("must reject empty key set");
        assert!(matches!(err, MutationError::NoAffectedKeys));
    }

    #[tokio::test]
    async fn optimistic_value_visible_before_mutator_settles() {
        let fx = fixture();
        let key = namespace::bancos();
        fx.store.set(&key, json!({ "capitalActual": 1000 }));

        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate_rx = Arc::new(StdMutex::new(Some(gate_rx)));
        let mutator: Arc<dyn Mutator> = Arc::new(FnMutator::new(move |v: Value| {
            let gate = gate_rx
                .lock()
                .expect("gate lock")
                .take()
                .expect("single call");
            async move {
                let _ = gate.await;
                Ok(v)
            }
        }));

        let pending = {
            let engine_store = Arc::clone(&fx.store);
            let config = add_funds_config();
            let mutation = fx
                .engine
                .mutate(mutator, json!({ "amount": 500 }), &config);
            tokio::pin!(mutation);

            // Not yet polled: the optimistic write happens inside mutate()
            // before its first await, so poll once and inspect.
            let _ = futures::future::poll_immediate(mutation.as_mut()).await;
            assert_eq!(
                engine_store.get(&key).expect("entry").value.as_deref(),
                Some(&json!({ "capitalActual": 1500 }))
            );

            gate_tx.send(()).expect("mutator still waiting");
            mutation.await
        };
        pending.expect("mutation succeeds");
    }

    #[tokio::test]
    async fn failed_mutation_rolls_back_to_snapshot() {
        let fx = fixture();
        let key = namespace::bancos();
        fx.store.set(&key, json!({ "capitalActual": 1000 }));

        let mutator: Arc<dyn Mutator> = Arc::new(FnMutator::new(|_v: Value| async {
            Err(FetchError::application("insufficient funds"))
        }));
        let err = fx
            .engine
            .mutate(mutator, json!({ "amount": 500 }), &add_funds_config())
            .await
            .expect_err("mutation fails");
        assert!(matches!(err, MutationError::Execution { .. }));

        let entry = fx.store.get(&key).expect("entry");
        assert_eq!(
            entry.value.as_deref(),
            Some(&json!({ "capitalActual": 1000 }))
        );
    }

    #[tokio::test]
    async fn successful_mutation_marks_affected_keys_stale() {
        let fx = fixture();
        let key = namespace::bancos();
        fx.store.set(&key, json!({ "capitalActual": 1000 }));

        let mutator: Arc<dyn Mutator> = Arc::new(FnMutator::new(|v: Value| async move { Ok(v) }));
        let receipt = fx
            .engine
            .mutate(mutator, json!({ "amount": 500 }), &add_funds_config())
            .await
            .expect("mutation succeeds");

        assert_eq!(receipt.invalidations.len(), 1);
        // No subscriber and no registered fetcher: reconciliation is left
        // pending as staleness.
        assert_eq!(fx.store.get(&key).expect("entry").status, EntryStatus::Stale);
    }

    #[tokio::test]
    async fn projection_applies_to_every_affected_key() {
        let fx = fixture();
        let bancos = namespace::bancos();
        let kpis = namespace::kpis();
        fx.store.set(&bancos, json!({ "capitalActual": 1000 }));
        fx.store.set(&kpis, json!({ "capitalActual": 7000 }));

        let config = MutationConfig::new(vec![bancos.clone(), kpis.clone()], {
            add_funds_config().project
        });
        let mutator: Arc<dyn Mutator> = Arc::new(FnMutator::new(|v: Value| async move { Ok(v) }));
        fx.engine
            .mutate(mutator, json!({ "amount": 500 }), &config)
            .await
            .expect("mutation succeeds");

        // Both keys were projected; both were then marked stale.
        for (key, expected) in [(&bancos, 1500), (&kpis, 7500)] {
            let entry = fx.store.get(key).expect("entry");
            assert_eq!(
                entry.value.as_deref(),
                Some(&json!({ "capitalActual": expected }))
            );
            assert_eq!(entry.status, EntryStatus::Stale);
        }
    }

    #[tokio::test]
    async fn overlapping_mutations_roll_back_last_writer_wins() {
        let fx = fixture();
        let key = namespace::bancos();
        fx.store.set(&key, json!({ "capitalActual": 1000 }));

        fn gated_mutator(gate: oneshot::Receiver<()>) -> Arc<dyn Mutator> {
            let gate = Arc::new(StdMutex::new(Some(gate)));
            Arc::new(FnMutator::new(move |_v: Value| {
                let gate = gate
                    .lock()
                    .expect("gate lock")
                    .take()
                    .expect("single call");
                async move {
                    let _ = gate.await;
                    Err(FetchError::transport("write lost"))
                }
            }))
        }

        let (gate_a_tx, gate_a_rx) = oneshot::channel();
        let (gate_b_tx, gate_b_rx) = oneshot::channel();

        let config = add_funds_config();
        let mutation_a = fx
            .engine
            .mutate(gated_mutator(gate_a_rx), json!({ "amount": 500 }), &config);
        tokio::pin!(mutation_a);
        let _ = futures::future::poll_immediate(mutation_a.as_mut()).await;

        // B starts while A's optimistic 1500 is in the store, so B's
        // snapshot already contains it.
        let mutation_b = fx
            .engine
            .mutate(gated_mutator(gate_b_rx), json!({ "amount": 200 }), &config);
        tokio::pin!(mutation_b);
        let _ = futures::future::poll_immediate(mutation_b.as_mut()).await;
        assert_eq!(
            fx.store.get(&key).expect("entry").value.as_deref(),
            Some(&json!({ "capitalActual": 1700 }))
        );

        // B fails first: its rollback restores A's optimistic state, not
        // the true pre-mutation value.
        gate_b_tx.send(()).expect("b waiting");
        mutation_b.await.expect_err("b fails");
        assert_eq!(
            fx.store.get(&key).expect("entry").value.as_deref(),
            Some(&json!({ "capitalActual": 1500 }))
        );

        gate_a_tx.send(()).expect("a waiting");
        mutation_a.await.expect_err("a fails");
        assert_eq!(
            fx.store.get(&key).expect("entry").value.as_deref(),
            Some(&json!({ "capitalActual": 1000 }))
        );
    }
}
