//! Transazioni UTXO: input, output, payload da firmare e hash

use crate::crypto::{Address, CryptoError, SigningKey};
use crate::utxo::{Utxo, UtxoPool};
use crate::Hash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Marcatore di un output multisig nella serializzazione canonica
const MULTISIG_MARKER: u8 = 1;

/// Transazione: input ordinati, output ordinati, flag coinbase, timestamp e hash.
///
/// Il timestamp entra sia nel payload firmato sia nell'hash, quindi viene fissato
/// alla creazione: due transazioni identiche create in istanti diversi hanno
/// firme e hash diversi.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Input della transazione (UTXO spesi)
    pub inputs: Vec<TxInput>,
    /// Output della transazione (nuovi UTXO creati)
    pub outputs: Vec<TxOutput>,
    /// Transazione coinbase (reward del blocco)
    pub coinbase: bool,
    /// Nanosecondi Unix al momento della creazione
    pub timestamp: u64,
    /// SHA-256 della serializzazione canonica, zero finché non finalizzata
    hash: Hash,
}

/// Input di transazione (riferimento a UTXO esistente + prova di spesa)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Output precedente da spendere
    pub previous_output: Utxo,
    /// Firma (o firme) che sbloccano l'output
    pub proof: SpendProof,
}

/// Prova di spesa di un input
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpendProof {
    /// Input non ancora firmato
    #[default]
    Unsigned,
    /// Una firma per un output a indirizzo singolo
    Signature(Vec<u8>),
    /// Lista di firme per un output multisig, in ordine qualsiasi
    MultiSig(Vec<Vec<u8>>),
}

/// Output di transazione (nuovo UTXO creato)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Valore trasferito
    pub value: f64,
    /// Condizione di spesa
    pub lock: OutputLock,
}

/// Condizione di spesa di un output: esattamente una delle due forme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputLock {
    /// Spendibile con la firma di un solo indirizzo
    Address(Address),
    /// Spendibile con le firme di almeno `MULTISIG_THRESHOLD` indirizzi dell'insieme
    MultiSig(Vec<Address>),
}

impl Transaction {
    /// Crea transazione vuota con timestamp corrente
    pub fn new() -> Self {
        Self::with_timestamp(current_timestamp())
    }

    /// Crea transazione vuota con timestamp esplicito
    pub fn with_timestamp(timestamp: u64) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            coinbase: false,
            timestamp,
            hash: [0; 32],
        }
    }

    /// Crea transazione coinbase finalizzata che paga `value` a `address`
    pub fn coinbase(value: f64, address: Address) -> Self {
        Self::coinbase_at(value, address, current_timestamp())
    }

    /// Come `coinbase`, con timestamp esplicito
    pub fn coinbase_at(value: f64, address: Address, timestamp: u64) -> Self {
        let mut tx = Self::with_timestamp(timestamp);
        tx.coinbase = true;
        tx.add_output(value, address);
        tx.finalize();
        tx
    }

    pub fn is_coinbase(&self) -> bool {
        self.coinbase
    }

    /// Aggiunge un input non firmato che spende `(prev_tx_hash, index)`
    pub fn add_input(&mut self, prev_tx_hash: Hash, index: u32) {
        self.inputs.push(TxInput::new(Utxo::new(prev_tx_hash, index)));
    }

    /// Aggiunge un output a indirizzo singolo
    pub fn add_output(&mut self, value: f64, address: Address) {
        self.outputs.push(TxOutput::to_address(value, address));
    }

    /// Aggiunge un output multisig
    pub fn add_multisig_output(&mut self, value: f64, addresses: Vec<Address>) -> Result<(), TransactionError> {
        self.outputs.push(TxOutput::multisig(value, addresses)?);
        Ok(())
    }

    /// Rimuove l'input in posizione `index`
    pub fn remove_input(&mut self, index: usize) -> Option<TxInput> {
        if index < self.inputs.len() {
            Some(self.inputs.remove(index))
        } else {
            None
        }
    }

    /// Rimuove il primo input che spende `utxo`
    pub fn remove_input_for(&mut self, utxo: &Utxo) -> bool {
        match self.inputs.iter().position(|input| input.previous_output == *utxo) {
            Some(position) => {
                self.inputs.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn input(&self, index: usize) -> Option<&TxInput> {
        self.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&TxOutput> {
        self.outputs.get(index)
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// UTXO reclamati dagli input, in ordine
    pub fn claimed_utxos(&self) -> impl Iterator<Item = &Utxo> {
        self.inputs.iter().map(|input| &input.previous_output)
    }

    /// Dati da firmare per l'input `index`: timestamp, UTXO dell'input e tutti
    /// gli output in ordine. Le firme non ne fanno parte.
    pub fn signable_payload(&self, index: usize) -> Option<Vec<u8>> {
        let input = self.inputs.get(index)?;

        let mut data = Vec::new();
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data.extend_from_slice(&input.previous_output.tx_hash);
        data.extend_from_slice(&input.previous_output.index.to_be_bytes());

        for output in &self.outputs {
            output.encode_into(&mut data);
        }

        Some(data)
    }

    /// Imposta la firma (indirizzo singolo) dell'input `index`
    pub fn add_signature(&mut self, index: usize, signature: Vec<u8>) -> Result<(), TransactionError> {
        let input = self.input_mut(index)?;
        input.proof = SpendProof::Signature(signature);
        Ok(())
    }

    /// Aggiunge una firma multisig all'input `index`
    pub fn add_multisig_signature(&mut self, index: usize, signature: Vec<u8>) -> Result<(), TransactionError> {
        let input = self.input_mut(index)?;
        match &mut input.proof {
            SpendProof::MultiSig(signatures) => signatures.push(signature),
            proof => *proof = SpendProof::MultiSig(vec![signature]),
        }
        Ok(())
    }

    /// Firma l'input `index` con `key` e ricalcola l'hash
    pub fn sign(&mut self, key: &SigningKey, index: usize) -> Result<(), TransactionError> {
        let signature = self.sign_payload(key, index)?;
        self.add_signature(index, signature)?;
        self.finalize();
        Ok(())
    }

    /// Aggiunge la firma di `key` all'input multisig `index` e ricalcola l'hash
    pub fn sign_multisig(&mut self, key: &SigningKey, index: usize) -> Result<(), TransactionError> {
        let signature = self.sign_payload(key, index)?;
        self.add_multisig_signature(index, signature)?;
        self.finalize();
        Ok(())
    }

    fn sign_payload(&self, key: &SigningKey, index: usize) -> Result<Vec<u8>, TransactionError> {
        let payload = self.signable_payload(index).ok_or(TransactionError::InputOutOfRange {
            index,
            len: self.inputs.len(),
        })?;
        Ok(key.sign(&payload)?)
    }

    fn input_mut(&mut self, index: usize) -> Result<&mut TxInput, TransactionError> {
        let len = self.inputs.len();
        self.inputs
            .get_mut(index)
            .ok_or(TransactionError::InputOutOfRange { index, len })
    }

    /// Serializzazione canonica: timestamp, ogni input con le sue firme, ogni output
    pub fn raw_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&self.timestamp.to_be_bytes());

        for input in &self.inputs {
            data.extend_from_slice(&input.previous_output.tx_hash);
            data.extend_from_slice(&input.previous_output.index.to_be_bytes());
            match &input.proof {
                SpendProof::Unsigned => {}
                SpendProof::Signature(signature) => data.extend_from_slice(signature),
                SpendProof::MultiSig(signatures) => {
                    for signature in signatures {
                        data.extend_from_slice(signature);
                    }
                }
            }
        }

        for output in &self.outputs {
            output.encode_into(&mut data);
        }

        data
    }

    /// SHA-256 della serializzazione canonica
    pub fn compute_hash(&self) -> Hash {
        Sha256::digest(self.raw_bytes()).into()
    }

    /// Calcola e fissa l'hash; ultima modifica prima dell'invio
    pub fn finalize(&mut self) {
        self.hash = self.compute_hash();
    }

    /// Hash fissato dall'ultima `finalize`
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Vero se l'hash fissato corrisponde al contenuto attuale
    pub fn is_finalized(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Calcola total output value
    pub fn output_value(&self) -> f64 {
        self.outputs.iter().map(|output| output.value).sum()
    }

    /// Somma dei valori spesi; `None` se un input non è nel pool
    pub fn input_value(&self, pool: &UtxoPool) -> Option<f64> {
        self.claimed_utxos()
            .map(|utxo| pool.get(utxo).map(|output| output.value))
            .sum()
    }

    /// Dimensione della transazione in bytes
    pub fn size(&self) -> usize {
        bincode::serialize(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl TxInput {
    /// Crea nuovo input non firmato
    pub fn new(previous_output: Utxo) -> Self {
        Self {
            previous_output,
            proof: SpendProof::Unsigned,
        }
    }
}

impl SpendProof {
    /// Tutte le firme presenti, nell'ordine in cui sono state aggiunte
    pub fn signatures(&self) -> Vec<&[u8]> {
        match self {
            SpendProof::Unsigned => Vec::new(),
            SpendProof::Signature(signature) => vec![signature.as_slice()],
            SpendProof::MultiSig(signatures) => signatures.iter().map(Vec::as_slice).collect(),
        }
    }
}

impl TxOutput {
    /// Crea output per indirizzo singolo
    pub fn to_address(value: f64, address: Address) -> Self {
        Self {
            value,
            lock: OutputLock::Address(address),
        }
    }

    /// Crea output multisig; l'insieme di indirizzi non può essere vuoto
    pub fn multisig(value: f64, addresses: Vec<Address>) -> Result<Self, TransactionError> {
        if addresses.is_empty() {
            return Err(TransactionError::EmptyMultisig);
        }

        Ok(Self {
            value,
            lock: OutputLock::MultiSig(addresses),
        })
    }

    /// Indirizzo del destinatario se l'output non è multisig
    pub fn address(&self) -> Option<&Address> {
        match &self.lock {
            OutputLock::Address(address) => Some(address),
            OutputLock::MultiSig(_) => None,
        }
    }

    pub fn is_multisig(&self) -> bool {
        matches!(self.lock, OutputLock::MultiSig(_))
    }

    fn encode_into(&self, data: &mut Vec<u8>) {
        data.extend_from_slice(&self.value.to_bits().to_be_bytes());

        match &self.lock {
            OutputLock::MultiSig(addresses) => {
                data.push(MULTISIG_MARKER);
                data.extend_from_slice(&(addresses.len() as u32).to_be_bytes());
                for address in addresses {
                    data.extend_from_slice(&address.to_bytes());
                }
            }
            OutputLock::Address(address) => data.extend_from_slice(&address.to_bytes()),
        }
    }
}

/// Timestamp Unix corrente in nanosecondi
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

/// Errori di costruzione delle transazioni
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransactionError {
    #[error("Input index {index} out of range ({len} inputs)")]
    InputOutOfRange { index: usize, len: usize },

    #[error("Multisig output needs at least one address")]
    EmptyMultisig,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
