use std::future::IntoFuture;
use std::time::Duration;

use alloy::{
    eips::BlockNumberOrTag,
    network::TransactionResponse,
    primitives::{Address, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder, MULTICALL3_ADDRESS},
    rpc::types::Filter,
    sol_types::{SolCall, SolEvent},
    transports::{RpcError, TransportErrorKind},
};
use anyhow::Context;
use async_trait::async_trait;
use log::debug;
use url::Url;

use crate::{
    abis::{erc20::IERC20, multicall::Call3, multicall::IMulticall3, transfer},
    chain::{
        BlockInfo, ChainError, ChainResult, ChainSource, FeeData, RawLog, ReceiptInfo,
        TokenMetadata, TransactionInfo,
    },
};

/// Largest `decimals()` accepted from a token contract
const MAX_TOKEN_DECIMALS: u8 = 36;

/// JSON-RPC implementation of [`ChainSource`] on top of an alloy provider.
#[derive(Clone)]
pub struct RpcChainSource {
    provider: DynProvider,
    call_timeout: Duration,
}

impl RpcChainSource {
    pub fn new(rpc_url: &str, call_timeout: Duration) -> anyhow::Result<Self> {
        let url = Url::parse(rpc_url).context("Invalid RPC URL")?;

        let client = ProviderBuilder::new().connect_http(url);

        Ok(Self {
            provider: DynProvider::new(client),
            call_timeout,
        })
    }

    /// Applies the per-call timeout and maps transport failures.
    async fn call<T, F>(&self, fut: F) -> ChainResult<T>
    where
        F: IntoFuture<Output = Result<T, RpcError<TransportErrorKind>>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_rpc_error(e)),
            Err(_) => Err(ChainError::Timeout(self.call_timeout)),
        }
    }

    /// Same as [`Self::call`] for `sol!` contract calls.
    async fn contract_call<T, F>(&self, fut: F) -> ChainResult<T>
    where
        F: IntoFuture<Output = Result<T, alloy::contract::Error>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(alloy::contract::Error::TransportError(e))) => Err(map_rpc_error(e)),
            Ok(Err(e)) => Err(ChainError::Decode(e.to_string())),
            Err(_) => Err(ChainError::Timeout(self.call_timeout)),
        }
    }

    /// name/symbol/decimals in a single aggregate3 round trip.
    async fn token_metadata_multicall(&self, contract: Address) -> ChainResult<TokenMetadata> {
        let multicall = IMulticall3::new(MULTICALL3_ADDRESS, &self.provider);
        let token = IERC20::new(contract, &self.provider);

        let calls = vec![
            Call3 {
                target: contract,
                allowFailure: true,
                callData: token.name().calldata().to_vec().into(),
            },
            Call3 {
                target: contract,
                allowFailure: true,
                callData: token.symbol().calldata().to_vec().into(),
            },
            Call3 {
                target: contract,
                allowFailure: true,
                callData: token.decimals().calldata().to_vec().into(),
            },
        ];

        let results = self
            .contract_call(multicall.aggregate3(calls).call())
            .await?;

        if results.len() < 3 {
            return Err(ChainError::Decode(format!(
                "aggregate3 returned {} results for {}",
                results.len(),
                contract
            )));
        }

        // Decimals is required - the token is unusable without it
        if !results[2].success {
            return Err(ChainError::Decode(format!("decimals() reverted for {}", contract)));
        }
        let decimals = IERC20::decimalsCall::abi_decode_returns(&results[2].returnData)
            .map_err(|e| ChainError::Decode(e.to_string()))?;

        let name = if results[0].success {
            IERC20::nameCall::abi_decode_returns(&results[0].returnData).unwrap_or_default()
        } else {
            String::new()
        };

        let symbol = if results[1].success {
            IERC20::symbolCall::abi_decode_returns(&results[1].returnData).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(TokenMetadata {
            symbol,
            name,
            decimals,
        })
    }

    /// Fallback when multicall is unavailable on the chain.
    async fn token_metadata_individually(&self, contract: Address) -> ChainResult<TokenMetadata> {
        let token = IERC20::new(contract, &self.provider);

        let decimals = self.contract_call(token.decimals().call()).await?;
        let name = self
            .contract_call(token.name().call())
            .await
            .unwrap_or_default();
        let symbol = self
            .contract_call(token.symbol().call())
            .await
            .unwrap_or_default();

        Ok(TokenMetadata {
            symbol,
            name,
            decimals,
        })
    }
}

/// Maps alloy transport errors onto the [`ChainError`] taxonomy.
fn map_rpc_error(err: RpcError<TransportErrorKind>) -> ChainError {
    if let Some(payload) = err.as_error_resp() {
        return ChainError::from_payload(payload.code, payload.message.to_string());
    }

    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
    {
        ChainError::RateLimited(message)
    } else if err.is_transport_error() {
        ChainError::Transport(message)
    } else if matches!(err, RpcError::DeserError { .. } | RpcError::SerError(_)) {
        ChainError::Decode(message)
    } else {
        ChainError::Rpc {
            code: None,
            message,
        }
    }
}

#[async_trait]
impl ChainSource for RpcChainSource {
    async fn latest_block_number(&self) -> ChainResult<u64> {
        self.call(self.provider.get_block_number()).await
    }

    async fn get_transfer_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<RawLog>> {
        let filter = Filter::new()
            .address(contract)
            .event_signature(transfer::Transfer::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self.call(self.provider.get_logs(&filter)).await?;

        debug!(
            "eth_getLogs {} [{}, {}] returned {} logs",
            contract,
            from_block,
            to_block,
            logs.len()
        );

        Ok(logs
            .into_iter()
            .map(|log| RawLog {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                block_number: log.block_number,
                transaction_hash: log.transaction_hash,
                log_index: log.log_index,
            })
            .collect())
    }

    async fn get_transaction(&self, hash: B256) -> ChainResult<Option<TransactionInfo>> {
        let tx = self
            .call(self.provider.get_transaction_by_hash(hash))
            .await?;

        Ok(tx.map(|tx| TransactionInfo {
            hash: tx.tx_hash(),
            from: tx.from(),
            block_number: tx.block_number(),
            block_hash: tx.block_hash(),
            transaction_index: tx.transaction_index(),
            gas_price: tx.effective_gas_price,
        }))
    }

    async fn get_transaction_receipt(&self, hash: B256) -> ChainResult<Option<ReceiptInfo>> {
        let receipt = self
            .call(self.provider.get_transaction_receipt(hash))
            .await?;

        Ok(receipt.map(|r| ReceiptInfo {
            transaction_hash: r.transaction_hash,
            block_number: r.block_number,
            block_hash: r.block_hash,
            transaction_index: r.transaction_index,
            gas_used: r.gas_used,
            effective_gas_price: r.effective_gas_price,
            success: r.status(),
        }))
    }

    async fn get_block(&self, number: u64) -> ChainResult<Option<BlockInfo>> {
        let block = self
            .call(async {
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(number))
                    .await
            })
            .await?;

        Ok(block.map(|b| BlockInfo {
            number: b.header.number,
            hash: b.header.hash,
            timestamp: b.header.timestamp,
        }))
    }

    async fn get_fee_data(&self) -> ChainResult<FeeData> {
        let gas_price = self.call(self.provider.get_gas_price()).await?;

        // Legacy-only chains reject the EIP-1559 estimate; that is not an error here
        let eip1559 = self
            .call(async { self.provider.estimate_eip1559_fees().await })
            .await
            .ok();

        Ok(FeeData {
            gas_price,
            max_fee_per_gas: eip1559.as_ref().map(|f| f.max_fee_per_gas),
            max_priority_fee_per_gas: eip1559.as_ref().map(|f| f.max_priority_fee_per_gas),
        })
    }

    async fn token_metadata(&self, contract: Address) -> ChainResult<TokenMetadata> {
        let metadata = match self.token_metadata_multicall(contract).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(
                    "Multicall metadata fetch failed for {}: {}. Falling back to direct calls",
                    contract, e
                );
                self.token_metadata_individually(contract).await?
            },
        };

        if metadata.decimals > MAX_TOKEN_DECIMALS {
            return Err(ChainError::Decode(format!(
                "Token {} reports {} decimals",
                contract, metadata.decimals
            )));
        }

        Ok(metadata)
    }

    async fn balance_of(&self, contract: Address, owner: Address) -> ChainResult<U256> {
        let token = IERC20::new(contract, &self.provider);
        self.contract_call(token.balanceOf(owner).call()).await
    }
}
