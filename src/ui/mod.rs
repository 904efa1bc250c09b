pub mod cli;
pub mod common;

pub use cli::{Cli, run_cli};

use crate::config::Config;
use crate::crypto::MasterKey;
use crate::keymgr::{MasterKeyProvider, encode_key};

/// Display the result of initialization to the user
pub fn display_init_result(config: &Config, provider: &MasterKeyProvider, master_key: &MasterKey) {
    let key_base64 = encode_key(master_key);

    println!("✅ Vault created at: {}", config.data_dir.display());
    println!("   Scratch images: {}", config.scratch_dir().display());
    println!("\n✅ Vault key generated:\n");
    println!("    {}\n", key_base64);
    println!("⚠️  IMPORTANT: Save this key securely!");
    println!("    Records and images cannot be recovered without it.\n");

    if provider.allows_keyring() {
        println!("✅ Vault key saved to system keyring");
        println!("   Service: {}", provider.service());
        println!("   Account: {}", provider.account());
    } else {
        println!("ℹ️  Keyring disabled. Use --key to provide it in future commands:");
        println!("   cardvault --key \"{}\" <command>", key_base64);
    }
}
