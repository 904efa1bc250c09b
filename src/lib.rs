//! Local vault for payment cards, loyalty cards and passwords.
//!
//! Records are encoded into opaque strings ([`codec`]) and kept in an
//! encrypted key-value store ([`store`]); their images move from an
//! unencrypted scratch directory into encrypted storage on save ([`assets`]).

pub mod assets;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod file_cipher;
pub mod id_gen;
pub mod images;
pub mod keymgr;
pub mod kv;
pub mod service;
pub mod store;
pub mod ui;
