use crate::collaborators::Ledger;
use crate::domain::TxHash;
use crate::{Error, Result};
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, U256};
use std::sync::Arc;
use tracing::debug;

/// [`Ledger`] backed by an ethers middleware stack.
///
/// Signing is left to the middleware (a `SignerMiddleware` or a node-managed
/// account).
pub struct EthersLedger<M> {
    client: Arc<M>,
}

impl<M: Middleware> EthersLedger<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M> Ledger for EthersLedger<M>
where
    M: Middleware + 'static,
{
    async fn estimate_gas(&self, data: &Bytes, to: Address) -> Result<(U256, U256)> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data.clone()).into();
        let gas = self
            .client
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| Error::Ledger(format!("estimate gas: {e}")))?;
        let gas_price = self
            .client
            .get_gas_price()
            .await
            .map_err(|e| Error::Ledger(format!("gas price: {e}")))?;
        Ok((gas, gas_price))
    }

    async fn broadcast(
        &self,
        from: Address,
        to: Address,
        gas: U256,
        gas_price: U256,
        data: Bytes,
    ) -> Result<TxHash> {
        let tx = TransactionRequest::new()
            .from(from)
            .to(to)
            .gas(gas)
            .gas_price(gas_price)
            .data(data);

        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| Error::Ledger(format!("broadcast: {e}")))?;
        let tx_hash = *pending;
        debug!("Broadcast transaction {:?} to {:?}", tx_hash, to);
        Ok(tx_hash)
    }
}
