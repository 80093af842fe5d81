//! Validazione delle transazioni e applicazione a lotti sul UTXO pool

use crate::crypto::Address;
use crate::transaction::{OutputLock, SpendProof, Transaction};
use crate::utxo::{Utxo, UtxoPool};
use crate::{Hash, MULTISIG_THRESHOLD};
use std::collections::HashSet;

/// Verifica `tx` contro `pool` e restituisce la fee (input - output).
///
/// Una coinbase è sempre valida qui: la sua somma viene controllata
/// all'accettazione del blocco. Il pool non viene modificato.
pub fn check_transaction(tx: &Transaction, pool: &UtxoPool) -> Result<f64, ValidationError> {
    if tx.is_coinbase() {
        return Ok(0.0);
    }

    let mut claimed: HashSet<Utxo> = HashSet::new();
    let mut input_sum = 0.0;

    for (index, input) in tx.inputs.iter().enumerate() {
        let utxo = input.previous_output;
        let output = pool.get(&utxo).ok_or(ValidationError::UtxoNotFound { utxo })?;
        let payload = tx
            .signable_payload(index)
            .ok_or(ValidationError::InvalidSignature { input: index })?;

        match &output.lock {
            OutputLock::MultiSig(addresses) => {
                let found = count_multisig_signers(&payload, &input.proof.signatures(), addresses);
                if found < MULTISIG_THRESHOLD {
                    return Err(ValidationError::MultisigThreshold { input: index, found });
                }
            }
            OutputLock::Address(address) => {
                let verified = match &input.proof {
                    SpendProof::Signature(signature) => address.verify(&payload, signature),
                    _ => false,
                };
                if !verified {
                    return Err(ValidationError::InvalidSignature { input: index });
                }
            }
        }

        if !claimed.insert(utxo) {
            return Err(ValidationError::DoubleSpend { utxo });
        }

        input_sum += output.value;
    }

    let mut output_sum = 0.0;
    for (index, output) in tx.outputs.iter().enumerate() {
        // scarta anche NaN
        if !(output.value >= 0.0) {
            return Err(ValidationError::NegativeOutput { index, value: output.value });
        }
        output_sum += output.value;
    }

    if !(input_sum >= output_sum) {
        return Err(ValidationError::InsufficientInputs {
            inputs: input_sum,
            outputs: output_sum,
        });
    }

    Ok(input_sum - output_sum)
}

/// Vero se `tx` è valida contro `pool`
pub fn is_valid(tx: &Transaction, pool: &UtxoPool) -> bool {
    check_transaction(tx, pool).is_ok()
}

/// Fee di `tx` rispetto a `pool`; `None` se un input non è nel pool
pub fn fee(tx: &Transaction, pool: &UtxoPool) -> Option<f64> {
    tx.input_value(pool).map(|inputs| inputs - tx.output_value())
}

/// Conta gli indirizzi distinti dell'insieme che hanno una firma valida,
/// fermandosi appena raggiunta la soglia.
fn count_multisig_signers(payload: &[u8], signatures: &[&[u8]], addresses: &[Address]) -> usize {
    let mut matched: HashSet<Address> = HashSet::new();

    for address in addresses {
        if matched.len() >= MULTISIG_THRESHOLD {
            break;
        }
        if matched.contains(address) {
            continue;
        }
        if signatures.iter().any(|signature| address.verify(payload, signature)) {
            matched.insert(*address);
        }
    }

    matched.len()
}

/// Transazione scartata durante un lotto
#[derive(Debug, Clone)]
pub struct RejectedTx {
    /// Posizione nella lista dei candidati
    pub position: usize,
    /// Hash della transazione scartata
    pub tx_hash: Hash,
    /// Motivo dello scarto
    pub reason: ValidationError,
}

/// Risultato di `apply_batch`
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Transazioni accettate, nell'ordine dei candidati
    pub accepted: Vec<Transaction>,
    /// Transazioni scartate con il motivo
    pub rejected: Vec<RejectedTx>,
    /// Pool dopo l'applicazione delle transazioni accettate
    pub pool: UtxoPool,
}

/// Applica `candidates` in ordine su una copia di `base_pool`.
///
/// Ogni candidato è verificato contro il pool già aggiornato dai precedenti,
/// quindi una transazione può spendere l'output di una accettata prima di lei.
pub fn apply_batch(candidates: &[Transaction], base_pool: &UtxoPool) -> BatchOutcome {
    let mut handler = TxHandler::new(base_pool.clone());
    let (accepted, rejected) = handler.run(candidates);

    BatchOutcome {
        accepted,
        rejected,
        pool: handler.into_pool(),
    }
}

/// Ledger pubblico con il proprio UTXO pool corrente
#[derive(Debug, Clone, Default)]
pub struct TxHandler {
    pool: UtxoPool,
}

impl TxHandler {
    /// Crea handler che possiede `pool`
    pub fn new(pool: UtxoPool) -> Self {
        Self { pool }
    }

    /// Pool corrente
    pub fn pool(&self) -> &UtxoPool {
        &self.pool
    }

    pub fn into_pool(self) -> UtxoPool {
        self.pool
    }

    pub fn is_valid(&self, tx: &Transaction) -> bool {
        is_valid(tx, &self.pool)
    }

    /// Accetta i candidati mutuamente validi, in ordine, e aggiorna il pool
    pub fn handle(&mut self, candidates: &[Transaction]) -> Vec<Transaction> {
        self.run(candidates).0
    }

    /// Come `handle`, ma scarta le transazioni con fee non positiva e
    /// restituisce le accettate ordinate per fee decrescente.
    pub fn max_fee_handle(&mut self, candidates: &[Transaction]) -> Vec<Transaction> {
        let mut accepted: Vec<(f64, Transaction)> = Vec::new();

        for tx in candidates {
            match check_transaction(tx, &self.pool) {
                Ok(fee) if fee > 0.0 => {
                    self.apply(tx);
                    accepted.push((fee, tx.clone()));
                }
                Ok(_) => log::debug!("Skipping zero-fee transaction {}", crate::short_hash(&tx.hash())),
                Err(reason) => log::debug!("Rejected transaction {}: {}", crate::short_hash(&tx.hash()), reason),
            }
        }

        // sort stabile: a parità di fee resta l'ordine di accettazione
        accepted.sort_by(|a, b| b.0.total_cmp(&a.0));
        accepted.into_iter().map(|(_, tx)| tx).collect()
    }

    fn run(&mut self, candidates: &[Transaction]) -> (Vec<Transaction>, Vec<RejectedTx>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for (position, tx) in candidates.iter().enumerate() {
            match check_transaction(tx, &self.pool) {
                Ok(_) => {
                    self.apply(tx);
                    accepted.push(tx.clone());
                }
                Err(reason) => {
                    log::debug!("Rejected transaction {}: {}", crate::short_hash(&tx.hash()), reason);
                    rejected.push(RejectedTx {
                        position,
                        tx_hash: tx.hash(),
                        reason,
                    });
                }
            }
        }

        log::debug!(
            "Batch applied: {} accepted, {} rejected, {} utxos",
            accepted.len(),
            rejected.len(),
            self.pool.len()
        );

        (accepted, rejected)
    }

    fn apply(&mut self, tx: &Transaction) {
        for utxo in tx.claimed_utxos() {
            self.pool.remove(utxo);
        }

        let tx_hash = tx.hash();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.pool.put(Utxo::new(tx_hash, index as u32), output.clone());
        }
    }
}

/// Motivi per cui una transazione non è valida
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("UTXO not found: {utxo}")]
    UtxoNotFound { utxo: Utxo },

    #[error("Invalid signature on input {input}")]
    InvalidSignature { input: usize },

    #[error("Multisig input {input} has {found} valid signers, needs {}", MULTISIG_THRESHOLD)]
    MultisigThreshold { input: usize, found: usize },

    #[error("UTXO claimed twice: {utxo}")]
    DoubleSpend { utxo: Utxo },

    #[error("Output {index} has invalid value {value}")]
    NegativeOutput { index: usize, value: f64 },

    #[error("Inputs {inputs} do not cover outputs {outputs}")]
    InsufficientInputs { inputs: f64, outputs: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SigningKey, TxOutput, COINBASE_REWARD};
    use proptest::prelude::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32]).unwrap()
    }

    /// Pool con una coinbase da 3.125 per `owner`
    fn funded_pool(owner: &SigningKey) -> (UtxoPool, Transaction) {
        let coinbase = Transaction::coinbase(COINBASE_REWARD, owner.address());
        let mut pool = UtxoPool::new();
        pool.put(Utxo::new(coinbase.hash(), 0), coinbase.outputs[0].clone());
        (pool, coinbase)
    }

    fn pay(prev: Hash, index: u32, outputs: &[(f64, &SigningKey)], signer: &SigningKey) -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(prev, index);
        for (value, to) in outputs {
            tx.add_output(*value, to.address());
        }
        tx.sign(signer, 0).unwrap();
        tx
    }

    #[test]
    fn test_valid_spend_of_coinbase() {
        let (a, b, c) = (key(1), key(2), key(3));
        let (pool, coinbase) = funded_pool(&a);

        let tx = pay(coinbase.hash(), 0, &[(1.0, &b), (2.0, &c)], &a);

        assert_eq!(check_transaction(&tx, &pool), Ok(0.125));

        let outcome = apply_batch(&[tx.clone()], &pool);
        assert_eq!(outcome.accepted.len(), 1);
        assert!(outcome.pool.contains(&Utxo::new(tx.hash(), 0)));
        assert!(outcome.pool.contains(&Utxo::new(tx.hash(), 1)));
        assert!(!outcome.pool.contains(&Utxo::new(coinbase.hash(), 0)));
        // il pool di partenza non cambia
        assert!(pool.contains(&Utxo::new(coinbase.hash(), 0)));
    }

    #[test]
    fn test_coinbase_always_valid() {
        let coinbase = Transaction::coinbase(1000.0, key(1).address());
        assert!(is_valid(&coinbase, &UtxoPool::new()));
    }

    #[test]
    fn test_missing_utxo() {
        let a = key(1);
        let tx = pay([9; 32], 0, &[(1.0, &a)], &a);

        assert!(matches!(
            check_transaction(&tx, &UtxoPool::new()),
            Err(ValidationError::UtxoNotFound { .. })
        ));
    }

    #[test]
    fn test_wrong_signer() {
        let (a, b) = (key(1), key(2));
        let (pool, coinbase) = funded_pool(&a);
        let tx = pay(coinbase.hash(), 0, &[(1.0, &b)], &b);

        assert_eq!(
            check_transaction(&tx, &pool),
            Err(ValidationError::InvalidSignature { input: 0 })
        );
    }

    #[test]
    fn test_unsigned_input() {
        let a = key(1);
        let (pool, coinbase) = funded_pool(&a);
        let mut tx = Transaction::new();
        tx.add_input(coinbase.hash(), 0);
        tx.add_output(1.0, a.address());
        tx.finalize();

        assert!(!is_valid(&tx, &pool));
    }

    #[test]
    fn test_double_spend_within_transaction() {
        let a = key(1);
        let (pool, coinbase) = funded_pool(&a);

        let mut tx = Transaction::new();
        tx.add_input(coinbase.hash(), 0);
        tx.add_input(coinbase.hash(), 0);
        tx.add_output(5.0, a.address());
        tx.sign(&a, 0).unwrap();
        tx.sign(&a, 1).unwrap();

        assert_eq!(
            check_transaction(&tx, &pool),
            Err(ValidationError::DoubleSpend {
                utxo: Utxo::new(coinbase.hash(), 0)
            })
        );
    }

    #[test]
    fn test_negative_output() {
        let (a, b) = (key(1), key(2));
        let (pool, coinbase) = funded_pool(&a);
        let tx = pay(coinbase.hash(), 0, &[(-1.0, &b), (2.0, &a)], &a);

        assert!(matches!(
            check_transaction(&tx, &pool),
            Err(ValidationError::NegativeOutput { index: 0, .. })
        ));
    }

    #[test]
    fn test_nan_output_rejected() {
        let a = key(1);
        let (pool, coinbase) = funded_pool(&a);
        let tx = pay(coinbase.hash(), 0, &[(f64::NAN, &a)], &a);

        assert!(!is_valid(&tx, &pool));
    }

    #[test]
    fn test_outputs_exceed_inputs() {
        let (a, b) = (key(1), key(2));
        let (pool, coinbase) = funded_pool(&a);
        let tx = pay(coinbase.hash(), 0, &[(3.0, &b), (0.2, &a)], &a);

        assert!(matches!(
            check_transaction(&tx, &pool),
            Err(ValidationError::InsufficientInputs { .. })
        ));
    }

    #[test]
    fn test_exact_spend_has_zero_fee() {
        let (a, b) = (key(1), key(2));
        let (pool, coinbase) = funded_pool(&a);
        let tx = pay(coinbase.hash(), 0, &[(COINBASE_REWARD, &b)], &a);

        assert_eq!(check_transaction(&tx, &pool), Ok(0.0));
        assert_eq!(fee(&tx, &pool), Some(0.0));
    }

    fn multisig_pool(signers: &[&SigningKey]) -> (UtxoPool, Utxo) {
        let output = TxOutput::multisig(2.0, signers.iter().map(|k| k.address()).collect()).unwrap();
        let utxo = Utxo::new([5; 32], 0);
        let mut pool = UtxoPool::new();
        pool.put(utxo, output);
        (pool, utxo)
    }

    fn multisig_spend(utxo: Utxo, signers: &[&SigningKey]) -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(utxo.tx_hash, utxo.index);
        tx.add_output(1.5, key(9).address());
        for signer in signers {
            tx.sign_multisig(signer, 0).unwrap();
        }
        tx
    }

    #[test]
    fn test_multisig_two_of_three() {
        let (a, b, c) = (key(1), key(2), key(3));
        let (pool, utxo) = multisig_pool(&[&a, &b, &c]);

        // l'ordine delle firme non conta
        assert!(is_valid(&multisig_spend(utxo, &[&c, &a]), &pool));
        assert!(is_valid(&multisig_spend(utxo, &[&b, &c]), &pool));
        assert!(is_valid(&multisig_spend(utxo, &[&a, &b, &c]), &pool));
    }

    #[test]
    fn test_multisig_single_signer_rejected() {
        let (a, b) = (key(1), key(2));
        let (pool, utxo) = multisig_pool(&[&a, &b]);

        assert_eq!(
            check_transaction(&multisig_spend(utxo, &[&a]), &pool),
            Err(ValidationError::MultisigThreshold { input: 0, found: 1 })
        );
    }

    #[test]
    fn test_multisig_duplicate_signatures_count_once() {
        let (a, b) = (key(1), key(2));
        let (pool, utxo) = multisig_pool(&[&a, &b]);

        assert!(!is_valid(&multisig_spend(utxo, &[&a, &a]), &pool));
    }

    #[test]
    fn test_multisig_duplicate_address_counts_once() {
        let a = key(1);
        let (pool, utxo) = multisig_pool(&[&a, &a]);

        assert!(!is_valid(&multisig_spend(utxo, &[&a]), &pool));
    }

    #[test]
    fn test_multisig_outsider_does_not_count() {
        let (a, b, outsider) = (key(1), key(2), key(4));
        let (pool, utxo) = multisig_pool(&[&a, &b]);

        assert!(!is_valid(&multisig_spend(utxo, &[&a, &outsider]), &pool));
    }

    #[test]
    fn test_multisig_requires_multisig_proof_on_single_output() {
        let a = key(1);
        let (pool, coinbase) = funded_pool(&a);
        let mut tx = Transaction::new();
        tx.add_input(coinbase.hash(), 0);
        tx.add_output(1.0, a.address());
        tx.sign_multisig(&a, 0).unwrap();

        assert!(!is_valid(&tx, &pool));
    }

    #[test]
    fn test_batch_chained_spend() {
        let (a, b) = (key(1), key(2));
        let (pool, coinbase) = funded_pool(&a);

        let first = pay(coinbase.hash(), 0, &[(3.0, &b)], &a);
        let second = pay(first.hash(), 0, &[(2.5, &a)], &b);

        let outcome = apply_batch(&[first.clone(), second.clone()], &pool);
        assert_eq!(outcome.accepted, vec![first.clone(), second.clone()]);
        assert!(outcome.pool.contains(&Utxo::new(second.hash(), 0)));
        assert!(!outcome.pool.contains(&Utxo::new(first.hash(), 0)));

        // in ordine inverso il figlio non trova il suo input
        let reversed = apply_batch(&[second, first.clone()], &pool);
        assert_eq!(reversed.accepted, vec![first]);
        assert_eq!(reversed.rejected.len(), 1);
        assert_eq!(reversed.rejected[0].position, 0);
    }

    #[test]
    fn test_batch_conflict_first_wins() {
        let (a, b, c) = (key(1), key(2), key(3));
        let (pool, coinbase) = funded_pool(&a);

        let to_b = pay(coinbase.hash(), 0, &[(3.0, &b)], &a);
        let to_c = pay(coinbase.hash(), 0, &[(3.0, &c)], &a);

        let outcome = apply_batch(&[to_b.clone(), to_c.clone()], &pool);
        assert_eq!(outcome.accepted, vec![to_b]);
        assert_eq!(outcome.rejected[0].tx_hash, to_c.hash());
        assert!(matches!(outcome.rejected[0].reason, ValidationError::UtxoNotFound { .. }));
    }

    #[test]
    fn test_handler_advances_pool() {
        let (a, b) = (key(1), key(2));
        let (pool, coinbase) = funded_pool(&a);
        let mut handler = TxHandler::new(pool);

        let tx = pay(coinbase.hash(), 0, &[(3.0, &b)], &a);
        assert_eq!(handler.handle(&[tx.clone()]).len(), 1);

        // la stessa transazione ora è una doppia spesa
        assert!(handler.handle(&[tx.clone()]).is_empty());
        assert!(handler.pool().contains(&Utxo::new(tx.hash(), 0)));
        assert_eq!(handler.into_pool().len(), 1);
    }

    #[test]
    fn test_max_fee_handle_sorts_by_fee() {
        let (a, b) = (key(1), key(2));
        let funding = {
            let mut tx = Transaction::coinbase(10.0, a.address());
            tx.add_output(20.0, a.address());
            tx.add_output(5.0, a.address());
            tx.finalize();
            tx
        };
        let mut pool = UtxoPool::new();
        for (index, output) in funding.outputs.iter().enumerate() {
            pool.put(Utxo::new(funding.hash(), index as u32), output.clone());
        }

        let low = pay(funding.hash(), 0, &[(9.0, &b)], &a); // fee 1
        let high = pay(funding.hash(), 1, &[(16.0, &b)], &a); // fee 4
        let zero = pay(funding.hash(), 2, &[(5.0, &b)], &a); // fee 0

        let mut handler = TxHandler::new(pool);
        let accepted = handler.max_fee_handle(&[low.clone(), zero.clone(), high.clone()]);

        assert_eq!(accepted, vec![high, low]);
        // la transazione a fee zero non è stata applicata
        assert!(handler.pool().contains(&Utxo::new(funding.hash(), 2)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_batch_never_double_spends(
            picks in prop::collection::vec((0usize..4, prop::option::of(0usize..4), 0.0f64..2.0), 1..10)
        ) {
            let keys = [key(1), key(2), key(3)];
            let mut funding = Transaction::coinbase(1.0, keys[0].address());
            for index in 1..4 {
                funding.add_output(1.0, keys[index % 3].address());
            }
            funding.finalize();

            let mut pool = UtxoPool::new();
            for (index, output) in funding.outputs.iter().enumerate() {
                pool.put(Utxo::new(funding.hash(), index as u32), output.clone());
            }

            let candidates: Vec<Transaction> = picks
                .iter()
                .enumerate()
                .map(|(n, (first, second, value))| {
                    let mut tx = Transaction::with_timestamp(n as u64);
                    let mut spent = vec![*first];
                    spent.extend(second);
                    for output in &spent {
                        tx.add_input(funding.hash(), *output as u32);
                    }
                    tx.add_output(*value, keys[n % 3].address());
                    for (input, output) in spent.iter().enumerate() {
                        tx.sign(&keys[output % 3], input).unwrap();
                    }
                    tx
                })
                .collect();

            let outcome = apply_batch(&candidates, &pool);

            let mut claimed = HashSet::new();
            for tx in &outcome.accepted {
                for utxo in tx.claimed_utxos() {
                    prop_assert!(claimed.insert(*utxo), "UTXO {} claimed twice", utxo);
                }
            }
            prop_assert_eq!(outcome.accepted.len() + outcome.rejected.len(), candidates.len());
        }
    }
}
