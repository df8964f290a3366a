use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Key hierarchy
    #[error("failed to generate master key from seed")]
    SeedDerivation,
    #[error("failed to derive {0} key")]
    KeyDerivation(&'static str),
    #[error("derivation index {0} is not the next contiguous index for this branch")]
    NonContiguousIndex(u32),

    // Header chain
    #[error("header at height {0} has no known parent")]
    OrphanHeader(u32),
    #[error("header at height {0} has bits {1:#x}, expected {2:#x}")]
    BadDifficulty(u32, u32, u32),
    #[error("header at height {0} does not meet its own target")]
    InsufficientWork(u32),
    #[error("checkpoint mismatch at height {0}")]
    CheckpointMismatch(u32),
    #[error("headers chunk is not contiguous with start height {0}")]
    NonContiguousChunk(u32),

    // FSM / protocol
    #[error("server reported a tip below our local tip")]
    ServerBehind,
    #[error("merkle root mismatch for tx {0}")]
    BadMerkleProof(bitcoin::Txid),
    #[error("server claimed tx {0} but would not return it")]
    InconsistentServer(bitcoin::Txid),
    #[error("not connected to the server")]
    NotConnected,

    // Transaction building
    #[error("transaction already has inputs")]
    InputsNotEmpty,
    #[error("output amount {0} is below the dust limit")]
    AmountBelowDustLimit(bitcoin::Amount),
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        needed: bitcoin::Amount,
        available: bitcoin::Amount,
    },
    #[error("no prevout known for input {0}")]
    MissingPrevout(usize),
    #[error("transaction is not one of our locked transactions")]
    UnknownLockedTransaction,

    // Persistence
    #[error("failed to read wallet snapshot: {0}")]
    PersistenceFailure(String),

    // Wrapped external errors
    #[error(transparent)]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
    #[error(transparent)]
    Bip32(#[from] bitcoin::bip32::Error),
    #[error(transparent)]
    Address(#[from] bitcoin::address::ParseError),
    #[error(transparent)]
    AddressFromScript(#[from] bitcoin::address::FromScriptError),
    #[error("sighash: {0}")]
    Sighash(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] bitcoin::consensus::encode::Error),

    // Backend pass-through for the injected server client / wallet db
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn backend(err: anyhow::Error) -> Self {
        Error::Backend(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
