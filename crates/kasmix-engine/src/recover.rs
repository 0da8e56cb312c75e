//! Session recovery: rebuild mix state from on-chain observation.
//!
//! Used when a session's persisted state lags reality (crash between
//! submit and save, store restored from backup). Recovery only ever
//! fast-forwards along the DAG, and it never invents key material: funds
//! sitting at an intermediate address whose key is gone are declared
//! stuck, loudly.

use tracing::{info, warn};

use kasmix_core::constants::MIN_CONFIRMATIONS;
use kasmix_session::{MixSession, MixStatus, Session, SessionId, now_millis};
use kasmix_wallet::keys::generate_keypair;

use crate::context::Engine;
use crate::error::EngineError;

impl Engine {
    /// Reconstruct one mix session's state by inspecting the chain.
    pub async fn recover_mix_session(&self, id: &SessionId) -> Result<MixSession, EngineError> {
        let _guard = self.lock_session(id)?;
        let mut session = self.get_mix_session(id)?;

        if session.status == MixStatus::Confirmed || session.has_paid_out() {
            return Ok(session);
        }

        self.utxos().refresh_daa_score().await?;

        // Funds at a known intermediate address with no key are
        // unrecoverable; never guess a key.
        if let Some(intermediate) = session.intermediate_address.clone() {
            let (entries, _) = self
                .utxos()
                .confirmed_utxos(&intermediate, MIN_CONFIRMATIONS)
                .await?;
            if !entries.is_empty() && session.intermediate_private_key.is_none() {
                let err = EngineError::Recovery("funds stuck, key missing".into());
                warn!(session = %id, intermediate = %intermediate, "recovery found stranded funds");
                session.status = MixStatus::Error;
                session.meta.error = Some(err.tagged());
                session.meta.updated_at = now_millis();
                self.sessions().set(Session::Mix(session.clone()))?;
                return Err(err);
            }

            if !entries.is_empty() && session.status != MixStatus::IntermediateConfirmed {
                // The hop already confirmed; re-arm the payout delay.
                session.intermediate_confirmed = true;
                session.intermediate_delay_until =
                    Some(now_millis() + self.random_payout_delay());
                session.status = MixStatus::IntermediateConfirmed;
                session.meta.updated_at = now_millis();
                self.sessions().set(Session::Mix(session.clone()))?;
                info!(session = %id, "recovery: intermediate already funded, fast-forwarded");
                return Ok(session);
            }
        } else {
            // No intermediate yet: check whether the deposit landed.
            let (_, sum) = self
                .utxos()
                .confirmed_utxos(&session.deposit_address, MIN_CONFIRMATIONS)
                .await?;
            if sum >= session.amount {
                let (keypair, address) = generate_keypair(self.config().network);
                session.intermediate_address = Some(address.encode());
                session.intermediate_private_key = Some(keypair.secret_hex());
                session.received_amount = Some(sum);
                session.status = MixStatus::DepositReceived;
                session.meta.updated_at = now_millis();
                self.sessions().set(Session::Mix(session.clone()))?;
                info!(session = %id, received = sum, "recovery: deposit found, intermediate generated");
                return Ok(session);
            }
        }

        // Delay elapsed with no payout: finish the job.
        if session.status == MixStatus::IntermediateConfirmed
            && now_millis() >= session.intermediate_delay_until.unwrap_or(0)
            && !session.has_paid_out()
        {
            self.run_mix_payout(&mut session).await?;
        }

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dest, engine_with_node, fund_confirmed};
    use kasmix_core::constants::SOMPI_PER_KAS;

    #[tokio::test]
    async fn recovers_confirmed_deposit() {
        let (engine, node, _dir) = engine_with_node();
        let session = engine
            .create_mix_session(vec![dest(SOMPI_PER_KAS)], SOMPI_PER_KAS)
            .unwrap();
        fund_confirmed(&node, &session.deposit_address, SOMPI_PER_KAS);

        let recovered = engine.recover_mix_session(&session.meta.id).await.unwrap();
        assert_eq!(recovered.status, MixStatus::DepositReceived);
        assert!(recovered.intermediate_private_key.is_some());
        assert_eq!(recovered.received_amount, Some(SOMPI_PER_KAS));
    }

    #[tokio::test]
    async fn recovery_leaves_unfunded_session_alone() {
        let (engine, _node, _dir) = engine_with_node();
        let session = engine
            .create_mix_session(vec![dest(SOMPI_PER_KAS)], SOMPI_PER_KAS)
            .unwrap();

        let recovered = engine.recover_mix_session(&session.meta.id).await.unwrap();
        assert_eq!(recovered.status, MixStatus::WaitingDeposit);
        assert!(recovered.intermediate_address.is_none());
    }

    #[tokio::test]
    async fn recovery_fast_forwards_funded_intermediate() {
        let (engine, node, _dir) = engine_with_node();
        let session = engine
            .create_mix_session(vec![dest(SOMPI_PER_KAS)], SOMPI_PER_KAS)
            .unwrap();
        fund_confirmed(&node, &session.deposit_address, SOMPI_PER_KAS);

        // Reach sent_to_intermediate through the monitor.
        engine.mix_monitor_tick().await; // deposit -> intermediate minted
        engine.mix_monitor_tick().await; // forward submitted
        node.advance_daa(100);
        node.confirm_pending();
        node.advance_daa(100);

        let recovered = engine.recover_mix_session(&session.meta.id).await.unwrap();
        assert_eq!(recovered.status, MixStatus::IntermediateConfirmed);
        assert!(recovered.intermediate_confirmed);
        assert!(recovered.intermediate_delay_until.is_some());
    }

    #[tokio::test]
    async fn stranded_funds_without_key_are_terminal() {
        let (engine, node, _dir) = engine_with_node();
        let session = engine
            .create_mix_session(vec![dest(SOMPI_PER_KAS)], SOMPI_PER_KAS)
            .unwrap();

        // Simulate a legacy record: intermediate funded but key lost.
        let mut broken = session.clone();
        broken.intermediate_address = Some(dest(1).address);
        fund_confirmed(&node, broken.intermediate_address.as_ref().unwrap(), SOMPI_PER_KAS);
        engine.sessions().set(Session::Mix(broken)).unwrap();

        let err = engine.recover_mix_session(&session.meta.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Recovery(_)));
        assert!(err.tagged().contains("[E_RECOVERY]"));

        let after = engine.get_mix_session(&session.meta.id).unwrap();
        assert_eq!(after.status, MixStatus::Error);
        assert!(after.meta.error.as_deref().unwrap().contains("funds stuck"));
    }

    #[tokio::test]
    async fn recovery_pays_out_when_delay_elapsed() {
        let (engine, node, _dir) = engine_with_node();
        let session = engine
            .create_mix_session(vec![dest(SOMPI_PER_KAS)], SOMPI_PER_KAS)
            .unwrap();
        fund_confirmed(&node, &session.deposit_address, SOMPI_PER_KAS);

        engine.mix_monitor_tick().await;
        engine.mix_monitor_tick().await;
        node.advance_daa(100);
        node.confirm_pending();
        node.advance_daa(100);
        engine.mix_monitor_tick().await; // intermediate_confirmed + delay armed

        // Collapse the delay.
        let mut m = engine.get_mix_session(&session.meta.id).unwrap();
        assert_eq!(m.status, MixStatus::IntermediateConfirmed);
        m.intermediate_delay_until = Some(0);
        engine.sessions().set(Session::Mix(m)).unwrap();

        let recovered = engine.recover_mix_session(&session.meta.id).await.unwrap();
        assert_eq!(recovered.status, MixStatus::Confirmed);
        assert_eq!(recovered.payout_tx_ids.len(), 1);
    }

    #[tokio::test]
    async fn recovery_is_refused_while_locked() {
        let (engine, _node, _dir) = engine_with_node();
        let session = engine
            .create_mix_session(vec![dest(SOMPI_PER_KAS)], SOMPI_PER_KAS)
            .unwrap();

        let _guard = engine.lock_session(&session.meta.id).unwrap();
        let err = engine.recover_mix_session(&session.meta.id).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionBusy));
    }
}
