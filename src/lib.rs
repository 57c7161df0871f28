pub mod builder;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod inspect;
pub mod signer;
pub mod transaction;
pub mod types;
pub mod utxo;
