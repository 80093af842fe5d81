//! UTXO e UTXO pool

use crate::transaction::TxOutput;
use crate::Hash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identità di un output non speso: (hash della transazione, indice dell'output).
/// L'ordinamento è lessicografico sull'hash, poi sull'indice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Utxo {
    /// Hash della transazione che ha creato l'output
    pub tx_hash: Hash,
    /// Indice dell'output nella transazione
    pub index: u32,
}

impl Utxo {
    /// Crea nuovo UTXO
    pub fn new(tx_hash: Hash, index: u32) -> Self {
        Self { tx_hash, index }
    }
}

impl fmt::Display for Utxo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.tx_hash), self.index)
    }
}

/// Insieme degli output spendibili, una fotografia per ramo.
/// `clone()` produce una copia indipendente della mappa.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtxoPool {
    outputs: HashMap<Utxo, TxOutput>,
}

impl UtxoPool {
    /// Crea pool vuoto
    pub fn new() -> Self {
        Self::default()
    }

    /// Associa `utxo` all'output `output`, sovrascrivendo un valore precedente
    pub fn put(&mut self, utxo: Utxo, output: TxOutput) {
        self.outputs.insert(utxo, output);
    }

    /// Rimuove `utxo` dal pool
    pub fn remove(&mut self, utxo: &Utxo) -> Option<TxOutput> {
        self.outputs.remove(utxo)
    }

    /// Output associato a `utxo`, se presente
    pub fn get(&self, utxo: &Utxo) -> Option<&TxOutput> {
        self.outputs.get(utxo)
    }

    pub fn contains(&self, utxo: &Utxo) -> bool {
        self.outputs.contains_key(utxo)
    }

    /// Tutti gli UTXO del pool, in ordine non significativo
    pub fn all(&self) -> Vec<Utxo> {
        self.outputs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Utxo, &TxOutput)> {
        self.outputs.iter()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Somma dei valori spendibili da `address` (output a indirizzo singolo)
    pub fn balance_of(&self, address: &crate::Address) -> f64 {
        self.outputs
            .values()
            .filter(|output| output.address() == Some(address))
            .map(|output| output.value)
            .sum()
    }
}
