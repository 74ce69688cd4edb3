//! Fan-out resolution of index scans.
//!
//! Turns an index partition (potentially many pages) into the set of
//! aggregates it points at:
//!
//! 1. page through the index partition with continuation tokens
//! 2. collect the distinct owners of each page
//! 3. dispatch aggregate reads in batches, at most `max_concurrent_batches`
//!    in flight (one read per owner, or one OR-filtered read per group of up
//!    to `max_filter_partitions` owners)
//! 4. re-verify each aggregate against the index hit and apply the caller's
//!    predicate before merging
//!
//! Cancellation is checked before each page fetch and before each dispatch.
//! Reads already in flight finish; they run with their own token so a
//! cancelled caller never merges a half-read aggregate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use idtable_configs::{FanoutStrategy, QuerySettings};
use idtable_store::TableQuery;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::aggregate_store::{UserAggregate, UserAggregateStore};
use crate::error::{IdentityStoreError, Result};
use crate::index_table::IndexTable;
use crate::rows::IndexEntry;

/// Tuning for one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutOptions {
    pub page_size: usize,
    pub max_concurrent_batches: usize,
    pub max_filter_partitions: usize,
    pub strategy: FanoutStrategy,
}

impl Default for FanoutOptions {
    fn default() -> Self {
        Self::from(&QuerySettings::default())
    }
}

impl From<&QuerySettings> for FanoutOptions {
    fn from(settings: &QuerySettings) -> Self {
        Self {
            page_size: settings.page_size,
            max_concurrent_batches: settings.max_concurrent_batches,
            max_filter_partitions: settings.max_filter_partitions,
            strategy: settings.strategy,
        }
    }
}

impl FanoutOptions {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_concurrent_batches(mut self, max: usize) -> Self {
        self.max_concurrent_batches = max;
        self
    }

    pub fn with_strategy(mut self, strategy: FanoutStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn batch_width(&self) -> usize {
        match self.strategy {
            FanoutStrategy::PerKey => 1,
            FanoutStrategy::Combined => self
                .max_filter_partitions
                .clamp(1, TableQuery::MAX_PARTITION_CLAUSES),
        }
    }
}

type BatchResult = Result<Vec<UserAggregate>>;

/// Resolves index partitions into aggregates.
#[derive(Clone)]
pub struct FanoutQueryEngine {
    aggregates: UserAggregateStore,
    index: IndexTable,
    options: FanoutOptions,
}

impl FanoutQueryEngine {
    pub fn new(aggregates: UserAggregateStore) -> Self {
        let options = FanoutOptions::from(&aggregates.context().query);
        let index = aggregates.index().clone();
        Self {
            aggregates,
            index,
            options,
        }
    }

    pub fn with_options(mut self, options: FanoutOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &FanoutOptions {
        &self.options
    }

    /// Resolve every aggregate referenced by `index_partition` that passes
    /// re-verification and `predicate`.
    ///
    /// The result holds each user once (by stable id); order is unspecified.
    pub async fn resolve<P>(
        &self,
        index_partition: &str,
        predicate: P,
        cancel: &CancellationToken,
    ) -> Result<Vec<UserAggregate>>
    where
        P: Fn(&UserAggregate) -> bool + Send + Sync,
    {
        if index_partition.is_empty() {
            return Ok(Vec::new());
        }
        let width = self.options.batch_width();
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_batches.max(1)));
        let mut join_set: JoinSet<BatchResult> = JoinSet::new();
        // owner primary key -> id the index claims it has
        let mut owners: HashMap<String, String> = HashMap::new();
        let mut merged: BTreeMap<String, UserAggregate> = BTreeMap::new();
        let mut failure: Option<IdentityStoreError> = None;
        let mut continuation = None;
        let mut pages = 0usize;

        'pages: loop {
            if cancel.is_cancelled() {
                failure = Some(IdentityStoreError::Cancelled);
                break;
            }
            let page = match self
                .index
                .query_by_partition(
                    index_partition,
                    self.options.page_size,
                    continuation.as_ref(),
                    cancel,
                )
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            pages += 1;

            let fresh: Vec<IndexEntry> = page
                .entries
                .into_iter()
                .filter(|entry| !owners.contains_key(&entry.primary_key))
                .collect();
            for entry in &fresh {
                owners.insert(entry.primary_key.clone(), entry.id.clone());
            }

            for batch in fresh.chunks(width) {
                if cancel.is_cancelled() {
                    failure = Some(IdentityStoreError::Cancelled);
                    break 'pages;
                }
                // Merge whatever already finished to keep memory flat
                while let Some(joined) = join_set.try_join_next() {
                    Self::merge(joined, &owners, &predicate, &mut merged, &mut failure);
                }
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break 'pages,
                };
                let keys: Vec<String> = batch.iter().map(|e| e.primary_key.clone()).collect();
                let aggregates = self.aggregates.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    read_batch(aggregates, keys).await
                });
            }

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        while let Some(joined) = join_set.join_next().await {
            Self::merge(joined, &owners, &predicate, &mut merged, &mut failure);
        }

        log::debug!(
            "Fan-out over {}: {} page(s), {} owner(s), {} resolved",
            index_partition,
            pages,
            owners.len(),
            merged.len()
        );
        match failure {
            Some(err) => Err(err),
            None => Ok(merged.into_values().collect()),
        }
    }

    fn merge<P>(
        joined: std::result::Result<BatchResult, tokio::task::JoinError>,
        owners: &HashMap<String, String>,
        predicate: &P,
        merged: &mut BTreeMap<String, UserAggregate>,
        failure: &mut Option<IdentityStoreError>,
    ) where
        P: Fn(&UserAggregate) -> bool,
    {
        let aggregates = match joined {
            Ok(Ok(aggregates)) => aggregates,
            Ok(Err(err)) => {
                failure.get_or_insert(err);
                return;
            }
            Err(err) => {
                log::error!("Fan-out read task failed: {}", err);
                failure.get_or_insert(IdentityStoreError::Storage(
                    idtable_store::StorageError::Other(err.to_string()),
                ));
                return;
            }
        };
        for aggregate in aggregates {
            // The index hit must still describe this aggregate
            let matches_index = owners
                .get(&aggregate.primary_key)
                .is_some_and(|id| id == aggregate.user.id.as_str());
            if !matches_index {
                log::debug!(
                    "Ignoring stale index hit for {} (owner changed)",
                    aggregate.primary_key
                );
                continue;
            }
            if !predicate(&aggregate) {
                log::debug!("Ignoring stale index hit for {}", aggregate.primary_key);
                continue;
            }
            let id = aggregate.user.id.as_str().to_string();
            let newer = merged
                .get(&id)
                .map_or(true, |existing| aggregate.user.updated_at > existing.user.updated_at);
            if newer {
                merged.insert(id, aggregate);
            }
        }
    }
}

async fn read_batch(aggregates: UserAggregateStore, keys: Vec<String>) -> BatchResult {
    // In-flight reads complete even if the caller cancels
    let token = CancellationToken::new();
    if let [key] = keys.as_slice() {
        return Ok(aggregates.read_aggregate(key, &token).await?.into_iter().collect());
    }
    aggregates.read_aggregates(&keys, &token).await
}
