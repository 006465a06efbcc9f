use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{anyhow, Result};
use log::{info, warn};
use moka::future::Cache;

use crate::{
    chain::{ChainError, ChainSource},
    db::{models::Token, LedgerStore},
    utils::{normalize_address, retry_with_backoff, RetryPolicy},
};

/// Resolves token metadata: memory cache, then the store, then the chain.
#[derive(Clone)]
pub struct TokenFetcher {
    chain: Arc<dyn ChainSource>,
    store: Arc<dyn LedgerStore>,
    chain_id: u64,
    policy: RetryPolicy,
    tokens: Cache<Address, Token>,
    /// Contracts whose metadata could not be read (no decimals, not a contract).
    /// Short TTL so a fixed RPC gets another chance soon.
    invalid_tokens: Cache<Address, String>,
}

impl TokenFetcher {
    pub fn new(
        chain: Arc<dyn ChainSource>,
        store: Arc<dyn LedgerStore>,
        chain_id: u64,
        policy: RetryPolicy,
    ) -> Self {
        let tokens = Cache::builder().max_capacity(1_000).build();

        let invalid_tokens = Cache::builder()
            .max_capacity(1_000)
            .time_to_live(Duration::from_secs(300))
            .build();

        Self {
            chain,
            store,
            chain_id,
            policy,
            tokens,
            invalid_tokens,
        }
    }

    pub async fn get(&self, address: Address) -> Result<Token> {
        if let Some(token) = self.tokens.get(&address).await {
            return Ok(token);
        }
        if let Some(reason) = self.invalid_tokens.get(&address).await {
            return Err(anyhow!("Token {} has no usable metadata: {}", address, reason));
        }

        let key = normalize_address(&address);
        if let Some(token) = self.store.get_token(self.chain_id, &key).await? {
            self.tokens.insert(address, token.clone()).await;
            return Ok(token);
        }

        let label = format!("token metadata {}", address);
        let metadata = match retry_with_backoff(
            &self.policy,
            &label,
            || self.chain.token_metadata(address),
            ChainError::retry_action,
        )
        .await
        {
            Ok(metadata) => metadata,
            Err(e) => {
                if matches!(e, ChainError::Decode(_)) {
                    self.invalid_tokens.insert(address, e.to_string()).await;
                }
                return Err(anyhow!("Failed to fetch metadata for {}: {}", address, e));
            },
        };

        let token = Token::from_metadata(self.chain_id, key, metadata);
        info!(
            "Fetched token {} ({}, {} decimals)",
            token.address, token.symbol, token.decimals
        );

        // A failed save only costs a re-fetch after restart
        if let Err(e) = self.store.set_token(&token).await {
            warn!("Failed to save token {}: {:#}", token.address, e);
        }

        self.tokens.insert(address, token.clone()).await;
        Ok(token)
    }

    /// Resolves all tracked tokens up front so a bad contract shows at startup.
    pub async fn warm_up(&self, addresses: &[Address]) -> Result<Vec<Token>> {
        let mut tokens = Vec::with_capacity(addresses.len());
        for address in addresses {
            tokens.push(self.get(*address).await?);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::db::MemoryStore;
    use crate::test_utils::{addr, MockChain, CHAIN_ID, TOKEN_A, WALLET};

    fn fetcher(chain: Arc<MockChain>, store: Arc<MemoryStore>) -> TokenFetcher {
        TokenFetcher::new(
            chain,
            store,
            CHAIN_ID,
            RetryPolicy::new(2, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_metadata_is_fetched_once_and_persisted() {
        let chain = Arc::new(MockChain::new(0));
        let store = Arc::new(MemoryStore::new());
        let tokens = fetcher(chain.clone(), store.clone());

        let token = tokens.get(addr(TOKEN_A)).await.unwrap();
        assert_eq!(token.symbol, "TKA");
        assert_eq!(token.decimals, 18);
        assert_eq!(token.address, TOKEN_A);

        tokens.get(addr(TOKEN_A)).await.unwrap();
        assert_eq!(chain.metadata_calls.load(Ordering::SeqCst), 1);

        // A fresh fetcher (restart) reads it back from the store
        let restarted = fetcher(chain.clone(), store.clone());
        restarted.get(addr(TOKEN_A)).await.unwrap();
        assert_eq!(chain.metadata_calls.load(Ordering::SeqCst), 1);
        assert!(store.get_token(CHAIN_ID, TOKEN_A).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_contract_is_remembered() {
        let chain = Arc::new(MockChain::new(0));
        let tokens = fetcher(chain.clone(), Arc::new(MemoryStore::new()));

        assert!(tokens.get(addr(WALLET)).await.is_err());
        assert!(tokens.get(addr(WALLET)).await.is_err());
        assert_eq!(chain.metadata_calls.load(Ordering::SeqCst), 1);
    }
}
