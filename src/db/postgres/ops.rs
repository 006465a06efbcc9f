use alloy::primitives::U256;
use anyhow::Context;
use async_trait::async_trait;
use log::error;
use tokio_postgres::{types::Json, Row};

use crate::db::models::{
    Checkpoint, IngestionGap, Token, Transaction, TransactionKey, WalletLedger,
};
use crate::db::postgres::PostgresClient;
use crate::db::LedgerStore;

/// Sanitize a string for PostgreSQL by removing null bytes (0x00)
/// which are invalid in UTF-8 text columns
fn sanitize_string(s: &str) -> String {
    s.replace('\0', "")
}

const TRANSACTION_COLUMNS: &str = r#"
    hash, token_contract, from_address, to_address, wallet_address,
    block_number, block_hash, transaction_index, log_index, block_timestamp,
    token_symbol, token_name, token_decimals, value, value_formatted,
    gas_used, gas_price, gas_fee, transaction_type, is_fee_collection, fee_type, status,
    created_at
"#;

const GAP_COLUMNS: &str = r#"
    wallet_address, chain_id, from_block, to_block, reason, attempts, permanent,
    first_seen_at, last_attempt_at, resolved_at
"#;

fn parse_u256(raw: &str, column: &str) -> anyhow::Result<U256> {
    U256::from_str_radix(raw, 10).with_context(|| format!("Invalid {} value: {}", column, raw))
}

fn row_to_transaction(row: &Row) -> anyhow::Result<Transaction> {
    let value: String = row.get("value");
    let gas_price: String = row.get("gas_price");
    let gas_fee: String = row.get("gas_fee");
    let transaction_type: String = row.get("transaction_type");
    let fee_type: Option<String> = row.get("fee_type");
    let status: String = row.get("status");

    Ok(Transaction {
        hash: row.get("hash"),
        block_number: row.get::<_, i64>("block_number") as u64,
        block_hash: row.get("block_hash"),
        transaction_index: row.get::<_, i64>("transaction_index") as u64,
        log_index: row.get::<_, i64>("log_index") as u64,
        timestamp: row.get("block_timestamp"),
        wallet_address: row.get("wallet_address"),
        from_address: row.get("from_address"),
        to_address: row.get("to_address"),
        token_contract: row.get("token_contract"),
        token_symbol: row.get("token_symbol"),
        token_name: row.get("token_name"),
        token_decimals: row.get::<_, i16>("token_decimals") as u8,
        value: parse_u256(&value, "value")?,
        value_formatted: row.get("value_formatted"),
        gas_used: row.get::<_, i64>("gas_used") as u64,
        gas_price: parse_u256(&gas_price, "gas_price")?,
        gas_fee: parse_u256(&gas_fee, "gas_fee")?,
        transaction_type: transaction_type.parse()?,
        is_fee_collection: row.get("is_fee_collection"),
        fee_type: fee_type.map(|f| f.parse()).transpose()?,
        status: status.parse()?,
        created_at: row.get("created_at"),
    })
}

fn row_to_gap(row: &Row) -> IngestionGap {
    IngestionGap {
        wallet_address: row.get("wallet_address"),
        chain_id: row.get::<_, i64>("chain_id") as u64,
        from_block: row.get::<_, i64>("from_block") as u64,
        to_block: row.get::<_, i64>("to_block") as u64,
        reason: row.get("reason"),
        attempts: row.get::<_, i32>("attempts") as u32,
        permanent: row.get("permanent"),
        first_seen_at: row.get("first_seen_at"),
        last_attempt_at: row.get("last_attempt_at"),
        resolved_at: row.get("resolved_at"),
    }
}

#[async_trait]
impl LedgerStore for PostgresClient {
    // ==================== TOKENS ====================

    async fn get_token(&self, chain_id: u64, address: &str) -> anyhow::Result<Option<Token>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT chain_id, address, symbol, name, decimals, created_at
            FROM feewatch.tokens
            WHERE chain_id = $1 AND address = $2
        "#;

        let row = client
            .query_opt(query, &[&(chain_id as i64), &address.to_lowercase()])
            .await?;

        Ok(row.map(|r| Token {
            chain_id: r.get::<_, i64>("chain_id") as u64,
            address: r.get("address"),
            symbol: r.get("symbol"),
            name: r.get("name"),
            decimals: r.get::<_, i16>("decimals") as u8,
            created_at: r.get("created_at"),
        }))
    }

    async fn set_token(&self, token: &Token) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO feewatch.tokens (chain_id, address, symbol, name, decimals, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (chain_id, address) DO UPDATE SET
                symbol = EXCLUDED.symbol,
                name = EXCLUDED.name,
                decimals = EXCLUDED.decimals
        "#;

        client
            .execute(
                query,
                &[
                    &(token.chain_id as i64),
                    &token.address,
                    &sanitize_string(&token.symbol),
                    &sanitize_string(&token.name),
                    &(token.decimals as i16),
                    &token.created_at,
                ],
            )
            .await
            .map_err(|e| {
                error!("Failed to insert token {}: {:?}", token.address, e);
                e
            })?;

        Ok(())
    }

    // ==================== TRANSACTIONS ====================

    async fn transaction_exists(&self, key: &TransactionKey) -> anyhow::Result<bool> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT 1 FROM feewatch.transactions
            WHERE hash = $1 AND token_contract = $2 AND from_address = $3 AND to_address = $4
        "#;

        let row = client
            .query_opt(
                query,
                &[&key.hash, &key.token_contract, &key.from_address, &key.to_address],
            )
            .await?;

        Ok(row.is_some())
    }

    async fn insert_transaction(&self, tx: &Transaction) -> anyhow::Result<bool> {
        let client = self.pool.get().await?;
        let query = format!(
            r#"
            INSERT INTO feewatch.transactions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23)
            ON CONFLICT (hash, token_contract, from_address, to_address) DO NOTHING
            "#,
            TRANSACTION_COLUMNS
        );

        let inserted = client
            .execute(
                query.as_str(),
                &[
                    &tx.hash,
                    &tx.token_contract,
                    &tx.from_address,
                    &tx.to_address,
                    &tx.wallet_address,
                    &(tx.block_number as i64),
                    &tx.block_hash,
                    &(tx.transaction_index as i64),
                    &(tx.log_index as i64),
                    &tx.timestamp,
                    &sanitize_string(&tx.token_symbol),
                    &sanitize_string(&tx.token_name),
                    &(tx.token_decimals as i16),
                    &tx.value.to_string(),
                    &tx.value_formatted,
                    &(tx.gas_used as i64),
                    &tx.gas_price.to_string(),
                    &tx.gas_fee.to_string(),
                    &tx.transaction_type.as_str(),
                    &tx.is_fee_collection,
                    &tx.fee_type.map(|f| f.as_str()),
                    &tx.status.as_str(),
                    &tx.created_at,
                ],
            )
            .await
            .map_err(|e| {
                error!("Failed to insert transaction {}: {:?}", tx.key(), e);
                e
            })?;

        Ok(inserted == 1)
    }

    async fn wallet_transactions(&self, wallet: &str) -> anyhow::Result<Vec<Transaction>> {
        let client = self.pool.get().await?;
        let query = format!(
            r#"
            SELECT {}
            FROM feewatch.transactions
            WHERE wallet_address = $1
            ORDER BY block_timestamp ASC, block_number ASC, transaction_index ASC, log_index ASC
            "#,
            TRANSACTION_COLUMNS
        );

        let rows = client
            .query(query.as_str(), &[&wallet.to_lowercase()])
            .await?;

        rows.iter().map(row_to_transaction).collect()
    }

    async fn count_wallet_transactions(&self, wallet: &str) -> anyhow::Result<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS n FROM feewatch.transactions WHERE wallet_address = $1",
                &[&wallet.to_lowercase()],
            )
            .await?;

        Ok(row.get::<_, i64>("n") as u64)
    }

    async fn latest_transaction_block(&self, wallet: &str) -> anyhow::Result<Option<u64>> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT MAX(block_number) AS block FROM feewatch.transactions WHERE wallet_address = $1",
                &[&wallet.to_lowercase()],
            )
            .await?;

        Ok(row.get::<_, Option<i64>>("block").map(|b| b as u64))
    }

    // ==================== LEDGER ====================

    async fn get_ledger(&self, wallet: &str) -> anyhow::Result<Option<WalletLedger>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT ledger FROM feewatch.wallet_ledgers WHERE wallet_address = $1",
                &[&wallet.to_lowercase()],
            )
            .await?;

        Ok(row.map(|r| {
            let Json(ledger): Json<WalletLedger> = r.get("ledger");
            ledger
        }))
    }

    async fn set_ledger(&self, ledger: &WalletLedger) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO feewatch.wallet_ledgers (wallet_address, ledger, total_transactions, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (wallet_address) DO UPDATE SET
                ledger = EXCLUDED.ledger,
                total_transactions = EXCLUDED.total_transactions,
                updated_at = EXCLUDED.updated_at
        "#;

        client
            .execute(
                query,
                &[
                    &ledger.wallet_address,
                    &Json(ledger),
                    &(ledger.total_transactions as i64),
                    &ledger.updated_at,
                ],
            )
            .await
            .map_err(|e| {
                error!("Failed to store ledger for {}: {:?}", ledger.wallet_address, e);
                e
            })?;

        Ok(())
    }

    // ==================== CHECKPOINT ====================

    async fn get_checkpoint(
        &self,
        wallet: &str,
        chain_id: u64,
    ) -> anyhow::Result<Option<Checkpoint>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT wallet_address, chain_id, last_processed_block, updated_at
            FROM feewatch.checkpoints
            WHERE wallet_address = $1 AND chain_id = $2
        "#;

        let row = client
            .query_opt(query, &[&wallet.to_lowercase(), &(chain_id as i64)])
            .await?;

        Ok(row.map(|r| Checkpoint {
            wallet_address: r.get("wallet_address"),
            chain_id: r.get::<_, i64>("chain_id") as u64,
            last_processed_block: r.get::<_, i64>("last_processed_block") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO feewatch.checkpoints (wallet_address, chain_id, last_processed_block, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (wallet_address, chain_id) DO UPDATE SET
                last_processed_block = GREATEST(
                    feewatch.checkpoints.last_processed_block,
                    EXCLUDED.last_processed_block
                ),
                updated_at = EXCLUDED.updated_at
        "#;

        client
            .execute(
                query,
                &[
                    &checkpoint.wallet_address,
                    &(checkpoint.chain_id as i64),
                    &(checkpoint.last_processed_block as i64),
                    &checkpoint.updated_at,
                ],
            )
            .await
            .map_err(|e| {
                error!(
                    "Failed to store checkpoint for {} on chain {}: {:?}",
                    checkpoint.wallet_address, checkpoint.chain_id, e
                );
                e
            })?;

        Ok(())
    }

    // ==================== GAPS ====================

    async fn record_gap(&self, gap: &IngestionGap) -> anyhow::Result<IngestionGap> {
        let client = self.pool.get().await?;
        let query = format!(
            r#"
            INSERT INTO feewatch.ingestion_gaps ({})
            VALUES ($1, $2, $3, $4, $5, 1, FALSE, $6, $6, NULL)
            ON CONFLICT (wallet_address, chain_id, from_block) DO UPDATE SET
                to_block = GREATEST(feewatch.ingestion_gaps.to_block, EXCLUDED.to_block),
                reason = EXCLUDED.reason,
                attempts = feewatch.ingestion_gaps.attempts + 1,
                last_attempt_at = EXCLUDED.last_attempt_at,
                resolved_at = NULL
            RETURNING {}
            "#,
            GAP_COLUMNS, GAP_COLUMNS
        );

        let row = client
            .query_one(
                query.as_str(),
                &[
                    &gap.wallet_address,
                    &(gap.chain_id as i64),
                    &(gap.from_block as i64),
                    &(gap.to_block as i64),
                    &sanitize_string(&gap.reason),
                    &gap.last_attempt_at,
                ],
            )
            .await
            .with_context(|| {
                format!("Failed to record gap [{}, {}]", gap.from_block, gap.to_block)
            })?;

        Ok(row_to_gap(&row))
    }

    async fn mark_gap_permanent(&self, gap: &IngestionGap) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            UPDATE feewatch.ingestion_gaps SET permanent = TRUE
            WHERE wallet_address = $1 AND chain_id = $2 AND from_block = $3
        "#;

        client
            .execute(
                query,
                &[
                    &gap.wallet_address,
                    &(gap.chain_id as i64),
                    &(gap.from_block as i64),
                ],
            )
            .await?;

        Ok(())
    }

    async fn resolve_gaps(
        &self,
        wallet: &str,
        chain_id: u64,
        through_block: u64,
    ) -> anyhow::Result<u64> {
        let client = self.pool.get().await?;
        let query = r#"
            UPDATE feewatch.ingestion_gaps SET resolved_at = NOW()
            WHERE wallet_address = $1 AND chain_id = $2 AND to_block <= $3
              AND resolved_at IS NULL AND permanent = FALSE
        "#;

        let resolved = client
            .execute(
                query,
                &[&wallet.to_lowercase(), &(chain_id as i64), &(through_block as i64)],
            )
            .await?;

        Ok(resolved)
    }

    async fn open_gaps(&self, wallet: &str, chain_id: u64) -> anyhow::Result<Vec<IngestionGap>> {
        let client = self.pool.get().await?;
        let query = format!(
            r#"
            SELECT {}
            FROM feewatch.ingestion_gaps
            WHERE wallet_address = $1 AND chain_id = $2 AND resolved_at IS NULL
            ORDER BY from_block ASC
            "#,
            GAP_COLUMNS
        );

        let rows = client
            .query(query.as_str(), &[&wallet.to_lowercase(), &(chain_id as i64)])
            .await?;

        Ok(rows.iter().map(row_to_gap).collect())
    }
}
