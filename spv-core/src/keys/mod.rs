//! Deterministic key hierarchy (C3) and the scripthash oracle (C4).

mod hierarchy;
mod scheme;

pub use hierarchy::KeyHierarchy;
pub use scheme::{NativeSegwitScheme, P2shSegwitScheme, ScriptHash, WalletScheme};

/// The two supported address schemes. Single-account BIP44-style wallet:
/// no legacy P2PKH, no multi-account support (see crate-level non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum WalletType {
    /// BIP49: witness program wrapped in a P2SH output.
    P2shSegwit,
    /// BIP84: bare witness program.
    NativeSegwit,
}

impl WalletType {
    /// Returns the purpose-field hardened child used at the root of the
    /// derivation path for this wallet type (BIP43).
    pub fn purpose(self) -> u32 {
        match self {
            WalletType::P2shSegwit => 49,
            WalletType::NativeSegwit => 84,
        }
    }

    /// Builds a [`WalletScheme`] implementing this wallet type's address
    /// and signing strategy.
    pub fn scheme(self) -> Box<dyn WalletScheme> {
        match self {
            WalletType::P2shSegwit => Box::new(P2shSegwitScheme),
            WalletType::NativeSegwit => Box::new(NativeSegwitScheme),
        }
    }
}
