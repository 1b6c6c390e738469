use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use std::sync::Arc;
use std::time::Duration;

use super::{AppendOutcome, EventStoreWriter, StoreError};
use crate::utils::IsTransient;
use crate::config::DatabaseSettings;
use crate::event_sourcing::core::EventEnvelope;
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};

// ============================================================================
// Postgres Event Store - append-only `events` table
// ============================================================================
//
// Responsibilities:
// 1. Own the long-lived connection pool shared by every processed message
// 2. Liveness check at startup
// 3. Append one event per call, keyed by (aggregate_id, version)
// 4. Turn duplicate appends into a no-op (ON CONFLICT DO NOTHING)
//
// No transaction spans more than one message.
//
// ============================================================================

const CREATE_EVENTS_TABLE: &str = "CREATE TABLE IF NOT EXISTS events (
    aggregate_id TEXT NOT NULL,
    version BIGINT NOT NULL,
    typecode TEXT NOT NULL,
    payload BYTEA NOT NULL,
    stored_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (aggregate_id, version)
)";

const INSERT_EVENT: &str = "INSERT INTO events (aggregate_id, version, typecode, payload)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (aggregate_id, version) DO NOTHING";

const MAX_CONNECTIONS: u32 = 4;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PgEventStore {
    pool: PgPool,
    circuit_breaker: CircuitBreaker,
}

impl PgEventStore {
    /// Build connection options from resolved settings
    pub fn connect_options(db: &DatabaseSettings) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .database(&db.name)
            .username(&db.user)
            .password(&db.password)
            .ssl_mode(PgSslMode::Prefer)
            .application_name(env!("CARGO_PKG_NAME"))
    }

    /// Open the pool and run the liveness check
    pub async fn connect(db: &DatabaseSettings) -> Result<Self, StoreError> {
        tracing::info!(
            host = %db.host,
            port = db.port,
            database = %db.name,
            user = %db.user,
            "Connecting to event store"
        );

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(Self::connect_options(db))
            .await
            .map_err(StoreError::Unavailable)?;

        let store = Self::from_pool(pool);
        store.ping().await?;

        tracing::info!("✅ Event store connection established");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        // Stop hammering the database while it is down; messages stay in the queue meanwhile
        let cb_config = CircuitBreakerConfig {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        };

        Self {
            pool,
            circuit_breaker: CircuitBreaker::new(cb_config),
        }
    }

    /// Report circuit breaker transitions to the metrics registry
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.circuit_breaker = self
            .circuit_breaker
            .with_listener(Arc::new(move |from, to| metrics.record_circuit_transition(from, to)));
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Liveness check
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Unavailable)?;
        Ok(())
    }

    /// Create the `events` table if it does not exist yet
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_EVENTS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Schema)?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn circuit_state(&self) -> crate::utils::CircuitState {
        self.circuit_breaker.get_state().await
    }

    async fn insert(&self, envelope: &EventEnvelope) -> Result<AppendOutcome, sqlx::Error> {
        let (aggregate_id, version) = envelope.key();
        let result = sqlx::query(INSERT_EVENT)
            .bind(aggregate_id)
            .bind(version)
            .bind(&envelope.type_code)
            .bind(envelope.payload.as_bytes())
            .execute(&self.pool)
            .await?;

        Ok(classify_rows_affected(result.rows_affected()))
    }
}

fn classify_rows_affected(rows: u64) -> AppendOutcome {
    if rows == 0 {
        AppendOutcome::AlreadyExists
    } else {
        AppendOutcome::Inserted
    }
}

/// Split an insert result for the circuit breaker. Only the outer error counts
/// as a breaker failure; a row the server refused says nothing about its health.
fn breaker_outcome(
    result: Result<AppendOutcome, sqlx::Error>,
) -> Result<Result<AppendOutcome, StoreError>, StoreError> {
    match result {
        Ok(outcome) => Ok(Ok(outcome)),
        Err(e) => {
            let error = StoreError::Append(e);
            if error.is_transient() {
                Err(error)
            } else {
                Ok(Err(error))
            }
        }
    }
}

#[async_trait]
impl EventStoreWriter for PgEventStore {
    async fn append(&self, envelope: &EventEnvelope) -> Result<AppendOutcome, StoreError> {
        let attempt = async { breaker_outcome(self.insert(envelope).await) };

        match self.circuit_breaker.call(attempt).await {
            Ok(Ok(outcome)) => {
                tracing::debug!(
                    aggregate_id = %envelope.aggregate_id,
                    version = envelope.version,
                    type_code = %envelope.type_code,
                    outcome = ?outcome,
                    "Appended event to store"
                );
                Ok(outcome)
            }
            Ok(Err(rejected)) => {
                tracing::warn!(
                    aggregate_id = %envelope.aggregate_id,
                    version = envelope.version,
                    error = %rejected,
                    "Event store rejected event"
                );
                Err(rejected)
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(
                    aggregate_id = %envelope.aggregate_id,
                    version = envelope.version,
                    "Circuit breaker open - event store unavailable"
                );
                Err(StoreError::CircuitOpen)
            }
            Err(CircuitBreakerError::OperationFailed(e)) => Err(e),
        }
    }
}
