//! The mix payout engine: final multi-destination spend.
//!
//! Re-fetches the intermediate balance, allocates proportionally, lets
//! the fee math converge to `inputs == outputs + fee` exactly, signs with
//! the intermediate key, submits, and records the payout. A session that
//! has already paid out is never re-entered.

use tracing::{error, info};

use kasmix_core::address::Address;
use kasmix_core::constants::MIN_CONFIRMATIONS;
use kasmix_core::crypto::KeyPair;
use kasmix_session::{MixSession, MixStatus, Session, now_millis};
use kasmix_wallet::builder::{check_standard_mass, compose, sign_all, submit};
use kasmix_wallet::fee::allocate_payout;

use crate::context::Engine;
use crate::error::EngineError;

impl Engine {
    /// Execute the payout for one mix session.
    ///
    /// Idempotent: a session already `confirmed` or holding payout tx ids
    /// short-circuits. If the store write after a successful submission
    /// fails, the error is logged loudly and the submission is NOT
    /// retried — the transaction is on the network either way.
    pub(crate) async fn run_mix_payout(&self, session: &mut MixSession) -> Result<(), EngineError> {
        if session.status == MixStatus::Confirmed || session.has_paid_out() {
            return Ok(());
        }

        let intermediate = session
            .intermediate_address
            .clone()
            .ok_or_else(|| EngineError::Payout("intermediate address missing".into()))?;
        let key_hex = session
            .intermediate_private_key
            .clone()
            .ok_or_else(|| EngineError::Payout("intermediate key missing".into()))?;
        let keypair = KeyPair::from_hex(&key_hex)
            .map_err(|e| EngineError::Payout(format!("intermediate key unusable: {e}")))?;

        // 1. Refetch what actually sits at the intermediate address.
        let (inputs, inputs_sum) = self
            .utxos()
            .confirmed_utxos(&intermediate, MIN_CONFIRMATIONS)
            .await?;
        if inputs.is_empty() {
            return Err(EngineError::NoConfirmed(intermediate));
        }

        // 2-5. Fee estimate, proportional allocation, recompute, balance.
        let destinations: Vec<(Address, u64)> = session
            .destinations
            .iter()
            .map(|d| Ok((self.parse_address(&d.address)?, d.amount)))
            .collect::<Result<_, EngineError>>()?;
        let (amounts, fee) = allocate_payout(self.rpc().as_ref(), &inputs, &destinations)
            .await
            .map_err(EngineError::from)?;

        debug_assert_eq!(amounts.iter().sum::<u64>() + fee, inputs_sum);

        // 6. Sign with the intermediate key and submit.
        let outputs: Vec<(Address, u64)> = destinations
            .into_iter()
            .map(|(address, _)| address)
            .zip(amounts.iter().copied())
            .collect();
        let mut signable = compose(&inputs, &outputs);
        check_standard_mass(&signable.transaction)
            .map_err(|e| EngineError::Payout(e.to_string()))?;
        sign_all(&mut signable, &keypair).map_err(|e| EngineError::Payout(e.to_string()))?;
        let tx_id = submit(self.rpc().as_ref(), &signable).await?;

        session.payout_tx_ids = vec![tx_id.to_string()];
        session.status = MixStatus::Confirmed;
        session.meta.updated_at = now_millis();
        info!(session = %session.meta.id, tx = %tx_id, fee, total = inputs_sum, "mix payout submitted");

        if let Err(e) = self.sessions().set(Session::Mix(session.clone())) {
            // The spend is on the network; repeating it would double-pay.
            error!(
                session = %session.meta.id,
                tx = %tx_id,
                error = %e,
                "CRITICAL: payout submitted but session save failed; will NOT resubmit"
            );
        }
        Ok(())
    }
}
