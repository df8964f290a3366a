use crate::error::{Error, Result};
use crate::keys::WalletType;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::script::{Builder, PushBytes};
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, CompressedPublicKey, Network, ScriptBuf, Sequence, Transaction, TxOut, Weight, Witness,
};

/// The server's primary index key: `reverse(SHA256(outputScript))`.
///
/// A bijection from (key, wallet type) to scripthash, used to subscribe to
/// and look up a single key's history on the remote server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptHash(pub [u8; 32]);

impl ScriptHash {
    pub fn from_script(script: &bitcoin::Script) -> Self {
        let digest = sha256::Hash::hash(script.as_bytes());
        let mut bytes = digest.to_byte_array();
        bytes.reverse();
        ScriptHash(bytes)
    }
}

impl std::fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// Serialized as a hex string (not the derived byte-array form) so it can be
// used as a JSON object key in persisted snapshots.
impl serde::Serialize for ScriptHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ScriptHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("scripthash must be 32 bytes"))?;
        Ok(ScriptHash(array))
    }
}

/// Capability set that the rest of the wallet core is parametric over: the
/// difference between P2SH-wrapped-SegWit (BIP49) and native SegWit (BIP84)
/// is entirely confined to computing addresses/scripts and to attaching and
/// signing inputs.
pub trait WalletScheme: Send + Sync {
    fn wallet_type(&self) -> WalletType;

    /// The scriptPubKey a single-sig wallet key pays to.
    fn output_script(&self, pubkey: &PublicKey) -> Result<ScriptBuf>;

    /// The human-readable address for `pubkey`.
    fn address(&self, pubkey: &PublicKey, network: Network) -> Result<Address> {
        let script = self.output_script(pubkey)?;
        Ok(Address::from_script(&script, network)?)
    }

    /// The Electrum-style scripthash this key subscribes under.
    fn scripthash(&self, pubkey: &PublicKey) -> Result<ScriptHash> {
        Ok(ScriptHash::from_script(&self.output_script(pubkey)?))
    }

    /// Approximate extra weight a signed input of this scheme adds; used by
    /// the coin selector's fee estimate (C8).
    fn input_weight(&self) -> Weight;

    /// The `nSequence` value to use when attaching an input for selection.
    fn sequence(&self) -> Sequence {
        Sequence::ENABLE_RBF_NO_LOCKTIME
    }

    /// Signs input `index` of `tx` (SIGHASH_ALL, BIP143 witness digest),
    /// populating `script_sig`/`witness` in place.
    fn sign_input(
        &self,
        secp: &Secp256k1<All>,
        tx: &mut Transaction,
        index: usize,
        prevout: &TxOut,
        secret_key: &SecretKey,
    ) -> Result<()>;

    /// Recovers the public key that signed input `index`, from its witness.
    fn extract_pubkey(&self, tx: &Transaction, index: usize) -> Result<PublicKey>;
}

fn compressed(secp: &Secp256k1<All>, secret_key: &SecretKey) -> CompressedPublicKey {
    CompressedPublicKey(secret_key.public_key(secp))
}

fn sign_p2wpkh(
    secp: &Secp256k1<All>,
    tx: &mut Transaction,
    index: usize,
    prevout: &TxOut,
    secret_key: &SecretKey,
) -> Result<()> {
    let pk = compressed(secp, secret_key);
    let witness_script = ScriptBuf::new_p2wpkh(&pk.wpubkey_hash());

    let sighash = SighashCache::new(&*tx)
        .p2wpkh_signature_hash(index, &witness_script, prevout.value, EcdsaSighashType::All)
        .map_err(|e| Error::Sighash(e.to_string()))?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let sig = secp.sign_ecdsa(&msg, secret_key);

    let mut sig_bytes = sig.serialize_der().to_vec();
    sig_bytes.push(EcdsaSighashType::All as u8);

    let mut witness = Witness::new();
    witness.push(sig_bytes);
    witness.push(pk.0.serialize());
    tx.input[index].witness = witness;
    Ok(())
}

fn extract_p2wpkh(tx: &Transaction, index: usize) -> Result<PublicKey> {
    let witness = &tx.input[index].witness;
    let pubkey_bytes = witness
        .last()
        .ok_or(Error::MissingPrevout(index))?;
    PublicKey::from_slice(pubkey_bytes).map_err(Error::from)
}

/// BIP49: the native-segwit witness program wrapped in a P2SH output.
pub struct P2shSegwitScheme;

impl WalletScheme for P2shSegwitScheme {
    fn wallet_type(&self) -> WalletType {
        WalletType::P2shSegwit
    }

    fn output_script(&self, pubkey: &PublicKey) -> Result<ScriptBuf> {
        let pk = CompressedPublicKey(*pubkey);
        let redeem_script = ScriptBuf::new_p2wpkh(&pk.wpubkey_hash());
        Ok(ScriptBuf::new_p2sh(&redeem_script.script_hash()))
    }

    fn input_weight(&self) -> Weight {
        // scriptSig push (23 bytes) + witness (stack: sig ~72B, pubkey 33B)
        Weight::from_wu(364)
    }

    fn sign_input(
        &self,
        secp: &Secp256k1<All>,
        tx: &mut Transaction,
        index: usize,
        prevout: &TxOut,
        secret_key: &SecretKey,
    ) -> Result<()> {
        sign_p2wpkh(secp, tx, index, prevout, secret_key)?;
        let pk = compressed(secp, secret_key);
        let redeem_script = ScriptBuf::new_p2wpkh(&pk.wpubkey_hash());
        let push_bytes = <&PushBytes>::try_from(redeem_script.as_bytes())
            .map_err(|e| Error::Sighash(e.to_string()))?;
        tx.input[index].script_sig = Builder::new().push_slice(push_bytes).into_script();
        Ok(())
    }

    fn extract_pubkey(&self, tx: &Transaction, index: usize) -> Result<PublicKey> {
        extract_p2wpkh(tx, index)
    }
}

/// BIP84: the bare witness program as the output script.
pub struct NativeSegwitScheme;

impl WalletScheme for NativeSegwitScheme {
    fn wallet_type(&self) -> WalletType {
        WalletType::NativeSegwit
    }

    fn output_script(&self, pubkey: &PublicKey) -> Result<ScriptBuf> {
        let pk = CompressedPublicKey(*pubkey);
        Ok(ScriptBuf::new_p2wpkh(&pk.wpubkey_hash()))
    }

    fn input_weight(&self) -> Weight {
        // empty scriptSig + witness (stack: sig ~72B, pubkey 33B)
        Weight::from_wu(272)
    }

    fn sign_input(
        &self,
        secp: &Secp256k1<All>,
        tx: &mut Transaction,
        index: usize,
        prevout: &TxOut,
        secret_key: &SecretKey,
    ) -> Result<()> {
        sign_p2wpkh(secp, tx, index, prevout, secret_key)
    }

    fn extract_pubkey(&self, tx: &Transaction, index: usize) -> Result<PublicKey> {
        extract_p2wpkh(tx, index)
    }
}
