//! Typed access to one aggregate kind, with conflict retry.

use std::marker::PhantomData;
use std::thread;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use herald_core::{AggregateId, ConcurrencyConflict, DomainError};
use herald_events::EventSource;

use crate::config::DispatchConfig;
use crate::retry::RetryPolicy;
use crate::store::{Storage, StoreError};
use crate::unit_of_work::{CommitError, CommitReceipt, UnitOfWork};

/// Repository operation error.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity} {aggregate_id} not found")]
    NotFound {
        entity: &'static str,
        aggregate_id: AggregateId,
    },
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Still conflicting after `attempts` tries; the caller should refresh and
    /// resubmit.
    #[error("{conflict} (after {attempts} attempt(s))")]
    Conflict {
        conflict: ConcurrencyConflict,
        attempts: u32,
    },
    #[error("failed to decode {entity} row: {source}")]
    Decode {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CommitError> for RepositoryError {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::Conflict(conflict) => RepositoryError::Conflict {
                conflict,
                attempts: 1,
            },
            CommitError::Store(err) => RepositoryError::Store(err),
        }
    }
}

impl RepositoryError {
    pub fn conflict(&self) -> Option<&ConcurrencyConflict> {
        match self {
            RepositoryError::Conflict { conflict, .. } => Some(conflict),
            _ => None,
        }
    }
}

/// Loads aggregates of kind `A` from rows and saves them through a
/// [`UnitOfWork`].
pub struct Repository<S, A> {
    storage: S,
    policy: RetryPolicy,
    _aggregate: PhantomData<fn() -> A>,
}

impl<S, A> Repository<S, A>
where
    S: Storage,
    A: EventSource + Serialize + DeserializeOwned,
    A::Id: Into<AggregateId>,
{
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            policy: RetryPolicy::default(),
            _aggregate: PhantomData,
        }
    }

    /// Repository whose conflict retries follow `config`
    /// (`conflict_attempts`, `conflict_base_delay`).
    pub fn from_config(storage: S, config: &DispatchConfig) -> Self {
        Self::new(storage).with_retry_policy(config.conflict_policy())
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Load an aggregate with the token it is stored under.
    pub fn load(&self, id: &A::Id) -> Result<Option<A>, RepositoryError> {
        let aggregate_id: AggregateId = id.clone().into();
        let Some(row) = self.storage.load(A::entity_name(), aggregate_id)? else {
            return Ok(None);
        };

        let mut aggregate: A =
            serde_json::from_value(row.state).map_err(|source| RepositoryError::Decode {
                entity: A::entity_name(),
                source,
            })?;
        aggregate.set_token(row.token);
        Ok(Some(aggregate))
    }

    pub fn get(&self, id: &A::Id) -> Result<A, RepositoryError> {
        self.load(id)?.ok_or_else(|| RepositoryError::NotFound {
            entity: A::entity_name(),
            aggregate_id: id.clone().into(),
        })
    }

    /// Persist one aggregate and its pending events. No retry: a stale token
    /// is reported as [`RepositoryError::Conflict`].
    pub fn save(&self, aggregate: &mut A) -> Result<CommitReceipt<A::Event>, RepositoryError> {
        let mut uow = UnitOfWork::new();
        uow.track(aggregate);
        Ok(uow.commit(&self.storage)?)
    }

    /// Load, apply `change`, save; on conflict re-read and re-apply, with
    /// jittered backoff, up to the policy's attempt limit.
    ///
    /// `change` may run more than once and must only touch the aggregate.
    pub fn execute<F>(
        &self,
        id: &A::Id,
        mut change: F,
    ) -> Result<(A, CommitReceipt<A::Event>), RepositoryError>
    where
        F: FnMut(&mut A) -> Result<(), DomainError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut aggregate = self.get(id)?;
            change(&mut aggregate)?;

            match self.save(&mut aggregate) {
                Ok(receipt) => {
                    debug!(entity = A::entity_name(), attempt, "change committed");
                    return Ok((aggregate, receipt));
                }
                Err(RepositoryError::Conflict { conflict, .. }) => {
                    if !self.policy.should_retry(attempt) {
                        warn!(
                            entity = A::entity_name(),
                            aggregate_id = %conflict.aggregate_id,
                            attempts = attempt,
                            "giving up after repeated conflicts"
                        );
                        return Err(RepositoryError::Conflict {
                            conflict,
                            attempts: attempt,
                        });
                    }
                    let delay = self.policy.delay_for_attempt(attempt);
                    debug!(
                        entity = A::entity_name(),
                        aggregate_id = %conflict.aggregate_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "conflict; retrying"
                    );
                    thread::sleep(delay);
                }
                Err(other) => return Err(other),
            }
        }
    }
}
