pub mod config;
pub mod core;
pub mod db;
pub mod envelope;
pub mod hashchain;
pub mod host;
pub mod identity;
pub mod keyserver;
pub mod mixkeys;
pub mod nymaddress;
pub mod pipeline;
pub mod primitives;
pub mod session;
pub mod signed_map;
pub mod transport;
pub mod wallet;

/// Aggregates every module's error type with `#[from]` conversions, for the
/// boundary functions the host-process loop calls — exactly the role the
/// teacher's `CoreError` plays over `StoreError`/`DbError`/`OpsError`.
#[derive(Debug, thiserror::Error)]
pub enum MuteError {
    #[error("{0}")]
    Core(#[from] core::CoreError),
    #[error("{0}")]
    Db(#[from] db::DbError),
    #[error("{0}")]
    Envelope(#[from] envelope::EnvelopeError),
    #[error("{0}")]
    HashChain(#[from] hashchain::HashChainError),
    #[error("{0}")]
    Host(#[from] host::HostError),
    #[error("{0}")]
    Identity(#[from] identity::IdentityError),
    #[error("{0}")]
    KeyServerCache(#[from] keyserver::KeyServerCacheError),
    #[error("{0}")]
    NymAddress(#[from] nymaddress::NymAddressError),
    #[error("{0}")]
    Pipeline(#[from] pipeline::PipelineError),
    #[error("{0}")]
    Primitive(#[from] primitives::PrimitiveError),
    #[error("{0}")]
    Session(#[from] session::SessionError),
    #[error("{0}")]
    SignedMap(#[from] signed_map::SignedMapError),
    #[error("{0}")]
    Transport(#[from] transport::TransportError),
    #[error("{0}")]
    Wallet(#[from] wallet::WalletError),
    #[error("{0}")]
    Config(#[from] config::ConfigError),
}
