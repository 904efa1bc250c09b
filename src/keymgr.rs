use crate::crypto::MasterKey;
use anyhow::{Context, Result, anyhow, bail};
use base64::{Engine as _, engine::general_purpose};
use keyring::Entry;
use log::{debug, info};
use rand::RngCore;
use zeroize::Zeroize;

#[derive(Clone)]
pub struct MasterKeySource {
    pub base64_inline: Option<String>,
    pub allow_keyring: bool,
}

pub struct MasterKeyProvider {
    src: MasterKeySource,
    service: String,
    account: String,
}

impl MasterKeyProvider {
    pub fn new(src: MasterKeySource, service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            src,
            service: service.into(),
            account: account.into(),
        }
    }

    pub fn allows_keyring(&self) -> bool {
        self.src.allow_keyring
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Inline key first, then the keyring. Only `init` may generate.
    pub fn obtain(&self) -> Result<MasterKey> {
        if let Some(inline) = self.src.base64_inline.as_ref() {
            let key = decode_key(inline).context("reading --key")?;
            info!("vault key provided inline");
            return Ok(key);
        }

        if self.src.allow_keyring
            && let Some(k) = self.read_keyring()?
        {
            info!("vault key loaded from keyring");
            return Ok(k);
        }

        bail!("no vault key available; run `cardvault init` or pass --key")
    }

    /// Generates a fresh key and stores it in the keyring when allowed.
    pub fn generate(&self) -> Result<MasterKey> {
        let key = generate_key();
        if self.src.allow_keyring {
            self.write_keyring(&encode_key(&key))?;
            info!("new vault key written to keyring");
        }
        Ok(key)
    }

    fn read_keyring(&self) -> Result<Option<MasterKey>> {
        let entry = Entry::new(&self.service, &self.account)?;
        match entry.get_password() {
            Ok(mut value) => {
                let key = decode_key(&value);
                value.zeroize();
                key.map(Some)
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                debug!("keyring read error: {e:?}");
                Err(anyhow!(e)).context("reading keyring")
            }
        }
    }

    fn write_keyring(&self, encoded: &str) -> Result<()> {
        let entry = Entry::new(&self.service, &self.account)?;
        entry.set_password(encoded).context("writing keyring")?;
        Ok(())
    }
}

pub fn encode_key(key: &MasterKey) -> String {
    general_purpose::STANDARD.encode(key.as_bytes())
}

pub fn decode_key(b64: &str) -> Result<MasterKey> {
    let mut bytes = general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|_| anyhow!("invalid base64 vault key"))?;
    if bytes.len() != 32 {
        bytes.zeroize();
        return Err(anyhow!("vault key must be 32 bytes"));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(MasterKey::from_bytes(arr))
}

fn generate_key() -> MasterKey {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    MasterKey::from_bytes(key)
}
