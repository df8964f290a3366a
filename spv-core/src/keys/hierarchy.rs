use crate::error::{Error, Result};
use crate::keys::WalletType;
use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::Network;

/// Account-branch child index (`root/0`).
const ACCOUNT_BRANCH: u32 = 0;
/// Change-branch child index (`root/1`).
const CHANGE_BRANCH: u32 = 1;

/// BIP32 derivation for the single BIP44-style account this wallet manages.
///
/// Holds the account-level extended private key (`m/purpose'/coin'/0'`) and
/// derives per-index account (`/0/i`) and change (`/1/i`) keys on demand.
/// Immutable once constructed.
#[derive(Clone)]
pub struct KeyHierarchy {
    wallet_type: WalletType,
    network: Network,
    account_xpriv: Xpriv,
    secp: Secp256k1<All>,
}

impl KeyHierarchy {
    /// Derives the hierarchy from a raw BIP32 seed.
    pub fn from_seed(seed: &[u8], network: Network, wallet_type: WalletType) -> Result<Self> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed).map_err(|_| Error::SeedDerivation)?;
        let account_xpriv = Self::derive_account_root(&secp, &master, network, wallet_type)?;
        Ok(Self {
            wallet_type,
            network,
            account_xpriv,
            secp,
        })
    }

    /// Derives the hierarchy from a BIP39 mnemonic and optional passphrase.
    #[cfg(feature = "mnemonic")]
    pub fn from_mnemonic(
        mnemonic: &bip39::Mnemonic,
        passphrase: &str,
        network: Network,
        wallet_type: WalletType,
    ) -> Result<Self> {
        let seed = mnemonic.to_seed(passphrase);
        Self::from_seed(&seed, network, wallet_type)
    }

    fn derive_account_root(
        secp: &Secp256k1<All>,
        master: &Xpriv,
        network: Network,
        wallet_type: WalletType,
    ) -> Result<Xpriv> {
        let coin_type = match network {
            Network::Bitcoin => 0,
            _ => 1,
        };
        let path = [
            ChildNumber::from_hardened_idx(wallet_type.purpose())
                .map_err(|_| Error::KeyDerivation("purpose"))?,
            ChildNumber::from_hardened_idx(coin_type)
                .map_err(|_| Error::KeyDerivation("coin_type"))?,
            ChildNumber::from_hardened_idx(0).map_err(|_| Error::KeyDerivation("account"))?,
        ];
        master
            .derive_priv(secp, &path)
            .map_err(|_| Error::KeyDerivation("account"))
    }

    fn derive_branch_key(&self, branch: u32, index: u32) -> Result<Xpriv> {
        let path = [
            ChildNumber::from_normal_idx(branch).map_err(|_| Error::KeyDerivation("branch"))?,
            ChildNumber::from_normal_idx(index).map_err(|_| Error::KeyDerivation("index"))?,
        ];
        self.account_xpriv
            .derive_priv(&self.secp, &path)
            .map_err(|_| Error::KeyDerivation("branch/index"))
    }

    /// Derives the private key at `root/0/index` (receive branch).
    pub fn derive_account_key(&self, index: u32) -> Result<Xpriv> {
        self.derive_branch_key(ACCOUNT_BRANCH, index)
    }

    /// Derives the private key at `root/1/index` (change branch).
    pub fn derive_change_key(&self, index: u32) -> Result<Xpriv> {
        self.derive_branch_key(CHANGE_BRANCH, index)
    }

    /// The account-level extended public key, for `GetRootPub`.
    pub fn account_xpub(&self) -> Xpub {
        Xpub::from_priv(&self.secp, &self.account_xpriv)
    }

    pub fn wallet_type(&self) -> WalletType {
        self.wallet_type
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hierarchy(wallet_type: WalletType) -> KeyHierarchy {
        KeyHierarchy::from_seed(&[7u8; 32], Network::Regtest, wallet_type).unwrap()
    }

    #[test]
    fn account_and_change_keys_differ() {
        let h = test_hierarchy(WalletType::NativeSegwit);
        let a0 = h.derive_account_key(0).unwrap();
        let c0 = h.derive_change_key(0).unwrap();
        assert_ne!(a0.private_key, c0.private_key);
    }

    #[test]
    fn derivation_is_deterministic() {
        let h = test_hierarchy(WalletType::P2shSegwit);
        let a0_first = h.derive_account_key(3).unwrap();
        let a0_second = h.derive_account_key(3).unwrap();
        assert_eq!(a0_first.private_key, a0_second.private_key);
    }

    #[test]
    fn distinct_indices_yield_distinct_keys() {
        let h = test_hierarchy(WalletType::NativeSegwit);
        let a0 = h.derive_account_key(0).unwrap();
        let a1 = h.derive_account_key(1).unwrap();
        assert_ne!(a0.private_key, a1.private_key);
    }
}
