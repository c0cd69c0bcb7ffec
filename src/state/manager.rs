//! PostgreSQL state manager

use super::{CursorStore, Saver, SettlementRecord, TransferStore, TxStatus, TxnDetails};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainSide;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Owns the connection pool and schema
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sent_transactions (
                hash VARCHAR(66) PRIMARY KEY,
                component TEXT NOT NULL DEFAULT '',
                nonce BIGINT NOT NULL,
                settled BOOLEAN NOT NULL DEFAULT FALSE,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Tables created before replacements were looked up by nonce
        sqlx::query(
            "ALTER TABLE sent_transactions ADD COLUMN IF NOT EXISTS component TEXT NOT NULL DEFAULT ''",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sent_transactions_nonce ON sent_transactions (component, nonce)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS integers (
                key TEXT PRIMARY KEY,
                value BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for side in [ChainSide::L1, ChainSide::Settlement] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {side}_transfers (
                    transfer_idx NUMERIC PRIMARY KEY,
                    amount NUMERIC NOT NULL,
                    recipient VARCHAR(42) NOT NULL,
                    nonce BIGINT NOT NULL,
                    chainhash VARCHAR(66) NOT NULL,
                    settled BOOLEAN NOT NULL DEFAULT FALSE,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{side}_transfers_chainhash ON {side}_transfers (chainhash)"
            ))
            .execute(&self.pool)
            .await?;
        }

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Store scoped to transfers finalized on `side`
    pub fn store(&self, side: ChainSide) -> PgStore {
        PgStore {
            pool: self.pool.clone(),
            component: side,
        }
    }
}

/// Postgres-backed store for one destination side
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    component: ChainSide,
}

impl PgStore {
    fn transfers_table(&self) -> String {
        format!("{}_transfers", self.component)
    }

    fn cursor_key(&self) -> String {
        format!("last_block_{}", self.component)
    }
}

fn hash_hex(hash: H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

fn parse_hash(raw: &str) -> RelayerResult<H256> {
    H256::from_str(raw).map_err(|e| RelayerError::Store(format!("Bad hash {}: {}", raw, e)))
}

fn parse_u256(raw: &str) -> RelayerResult<U256> {
    U256::from_dec_str(raw).map_err(|e| RelayerError::Store(format!("Bad number {}: {}", raw, e)))
}

fn record_from_row(row: &PgRow) -> RelayerResult<SettlementRecord> {
    let recipient: String = row.try_get("recipient")?;
    Ok(SettlementRecord {
        counterparty_index: parse_u256(&row.try_get::<String, _>("transfer_idx")?)?,
        amount: parse_u256(&row.try_get::<String, _>("amount")?)?,
        recipient: Address::from_str(&recipient)
            .map_err(|e| RelayerError::Store(format!("Bad address {}: {}", recipient, e)))?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        tx_hash: parse_hash(&row.try_get::<String, _>("chainhash")?)?,
        settled: row.try_get("settled")?,
    })
}

#[async_trait]
impl Saver for PgStore {
    async fn save(&self, hash: H256, nonce: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sent_transactions (hash, component, nonce)
            VALUES ($1, $2, $3)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(hash_hex(hash))
        .bind(self.component.as_str())
        .bind(nonce as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, hash: H256, status: &TxStatus) -> RelayerResult<()> {
        sqlx::query(
            r#"
            UPDATE sent_transactions
            SET settled = TRUE, status = $1, updated_at = NOW()
            WHERE hash = $2
            "#,
        )
        .bind(status.to_string())
        .bind(hash_hex(hash))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_txns(&self) -> RelayerResult<Vec<TxnDetails>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT s.hash, s.nonce, s.created_at
            FROM sent_transactions s
            JOIN {} t ON t.chainhash = s.hash
            WHERE s.settled = FALSE AND t.settled = FALSE
            ORDER BY s.nonce
            "#,
            self.transfers_table()
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TxnDetails {
                    hash: parse_hash(&row.try_get::<String, _>("hash")?)?,
                    nonce: row.try_get::<i64, _>("nonce")? as u64,
                    created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
                })
            })
            .collect()
    }

    async fn attempts(&self, nonce: u64) -> RelayerResult<Vec<H256>> {
        let rows = sqlx::query(
            r#"
            SELECT hash FROM sent_transactions
            WHERE component = $1 AND nonce = $2
            ORDER BY created_at
            "#,
        )
        .bind(self.component.as_str())
        .bind(nonce as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| parse_hash(&row.try_get::<String, _>("hash")?))
            .collect()
    }
}

#[async_trait]
impl TransferStore for PgStore {
    async fn store_transfer(
        &self,
        counterparty_index: U256,
        amount: U256,
        recipient: Address,
        nonce: u64,
        tx_hash: H256,
    ) -> RelayerResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (transfer_idx, amount, recipient, nonce, chainhash, settled)
            VALUES ($1::numeric, $2::numeric, $3, $4, $5, FALSE)
            ON CONFLICT (transfer_idx)
            DO UPDATE SET amount = $2::numeric, recipient = $3, nonce = $4,
                          chainhash = $5, settled = FALSE, updated_at = NOW()
            "#,
            self.transfers_table()
        ))
        .bind(counterparty_index.to_string())
        .bind(amount.to_string())
        .bind(format!("{:?}", recipient))
        .bind(nonce as i64)
        .bind(hash_hex(tx_hash))
        .execute(&self.pool)
        .await?;

        debug!(
            "Stored {} transfer {} with tx {:?} (nonce {})",
            self.component, counterparty_index, tx_hash, nonce
        );
        Ok(())
    }

    async fn mark_settled(&self, counterparty_index: U256) -> RelayerResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET settled = TRUE, updated_at = NOW() WHERE transfer_idx = $1::numeric",
            self.transfers_table()
        ))
        .bind(counterparty_index.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_settled(&self, counterparty_index: U256) -> RelayerResult<bool> {
        let row = sqlx::query(&format!(
            "SELECT settled FROM {} WHERE transfer_idx = $1::numeric",
            self.transfers_table()
        ))
        .bind(counterparty_index.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("settled")?),
            None => Ok(false),
        }
    }

    async fn settlement_record(
        &self,
        counterparty_index: U256,
    ) -> RelayerResult<Option<SettlementRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT transfer_idx::text AS transfer_idx, amount::text AS amount,
                   recipient, nonce, chainhash, settled
            FROM {}
            WHERE transfer_idx = $1::numeric
            "#,
            self.transfers_table()
        ))
        .bind(counterparty_index.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn unsettled_transfers(&self) -> RelayerResult<Vec<SettlementRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT transfer_idx::text AS transfer_idx, amount::text AS amount,
                   recipient, nonce, chainhash, settled
            FROM {}
            WHERE settled = FALSE
            ORDER BY transfer_idx
            "#,
            self.transfers_table()
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl CursorStore for PgStore {
    async fn last_block(&self) -> RelayerResult<Option<u64>> {
        let row = sqlx::query("SELECT value FROM integers WHERE key = $1")
            .bind(self.cursor_key())
            .fetch_optional(&self.pool)
            .await?;

        let value = row.map(|r| r.try_get::<i64, _>("value")).transpose()?;
        Ok(value.map(|v| v as u64))
    }

    async fn set_last_block(&self, block: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO integers (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key)
            DO UPDATE SET value = $2
            "#,
        )
        .bind(self.cursor_key())
        .bind(block as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved {} cursor: block {}", self.component, block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_round_trips() {
        let hash = H256::repeat_byte(0xab);
        let hex = hash_hex(hash);
        assert_eq!(hex.len(), 66);
        assert!(hex.starts_with("0xabab"));
        assert_eq!(parse_hash(&hex).unwrap(), hash);
    }
}
