//! blockrelay-node - Bitcoin (BCH-lineage) block-propagation relay
//!
//! A focused node crate: header-chain sync, block announcement, and
//! compact/xthin block reconstruction over a pluggable `ChainView`. It does
//! not implement consensus validation, a UTXO set, or mining - those are a
//! different collaborator's job; this crate only decides what to fetch, how
//! to fetch it cheaply, and when to tell peers about new work.

#[cfg(all(feature = "mimalloc", not(target_os = "windows")))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cli;
pub mod config;
pub mod domain;
pub mod network;
pub mod node;
pub mod utils;
