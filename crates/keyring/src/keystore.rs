//! On-disk keystore for wrapped key material.
//!
//! One file per (key, wrapping provider), JSON-encoded, named
//! `<key-id><ext>.nks.json` where `<ext>` is empty for the built-in AEAD
//! provider and `.<provider>[.<name>]` otherwise. The directory is owned
//! exclusively by this process (`0700`, files `0600`) and writes are
//! atomic-replace so a crash cannot leave a half-written record.
//!
//! Load is unforgiving on purpose: a key file that is present but cannot
//! be restored is fatal to startup, because silently proceeding with
//! fewer keys would hide data loss. Files that are not key files at all
//! — subdirectories, other extensions, names that do not start with a
//! UUID — are skipped; operators do leave the odd README behind.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;
use zeroize::Zeroizing;

use rafter_kms::{KekProviderConfig, PROVIDER_AEAD, ProviderConfigs, aead::AeadKekWrapper};

use crate::{
    error::{KeyringError, Result},
    types::{KeyId, RootKey, WrappedRootKey},
};

/// Extension shared by every keystore file.
pub const KEYSTORE_EXT: &str = ".nks.json";

/// The per-node durable store of wrapped root keys.
#[derive(Debug)]
pub struct Keystore {
    dir: PathBuf,
    providers: ProviderConfigs,
}

impl Keystore {
    /// Opens (creating if needed) the keystore directory.
    pub async fn open(dir: impl Into<PathBuf>, providers: ProviderConfigs) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| KeyringError::keystore_io(&dir, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|e| KeyringError::keystore_io(&dir, e))?;
        }
        Ok(Self { dir, providers })
    }

    /// The keystore directory path.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Wraps and persists a root key under every provider on its
    /// metadata, one file each. The first provider failure aborts the
    /// whole save.
    pub async fn save(&self, root_key: &RootKey) -> Result<()> {
        for provider in root_key.meta.effective_providers() {
            let wrapped = self.wrap_root_key(root_key, &provider).await?;
            let path = self.dir.join(file_name(&root_key.meta.key_id, &provider));

            let payload = serde_json::to_vec_pretty(&wrapped)
                .map_err(|e| KeyringError::Internal(format!("keystore record encode: {e}")))?;
            write_atomic(&path, &payload).await?;
            debug!(key = %root_key.meta.key_id, provider = %wrapped.provider, "saved key to keystore");
        }
        Ok(())
    }

    async fn wrap_root_key(
        &self,
        root_key: &RootKey,
        provider: &KekProviderConfig,
    ) -> Result<WrappedRootKey> {
        let key_id = root_key.meta.key_id.to_string();
        let is_aead = provider.provider.is_empty() || provider.provider == PROVIDER_AEAD;
        let kek = is_aead.then(AeadKekWrapper::generate_kek);

        let wrapper =
            self.providers.wrapper(&provider.provider, &provider.name, &key_id, kek.as_ref())?;

        let encrypted_dek = wrapper.wrap(&root_key.key).await?;
        let encrypted_rsa = match &root_key.rsa_key {
            Some(der) if !der.is_empty() => wrapper.wrap(der).await?,
            _ => Vec::new(),
        };

        Ok(WrappedRootKey {
            meta: root_key.meta.clone(),
            encrypted_data_encryption_key: encrypted_dek,
            encrypted_rsa_key: encrypted_rsa,
            key_encryption_key: kek.map(|k| k.to_vec()).unwrap_or_default(),
            provider: if is_aead { PROVIDER_AEAD.to_string() } else { provider.provider.clone() },
            provider_name: provider.name.clone(),
        })
    }

    /// Walks the keystore directory and restores every key file.
    ///
    /// Subdirectories, files without the keystore extension, and files
    /// whose name does not start with a UUID are skipped. Every
    /// surviving file must restore cleanly or the whole load fails.
    pub async fn load(&self) -> Result<Vec<RootKey>> {
        let mut keys = Vec::new();
        let mut entries =
            fs::read_dir(&self.dir).await.map_err(|e| KeyringError::keystore_io(&self.dir, e))?;

        while let Some(entry) =
            entries.next_entry().await.map_err(|e| KeyringError::keystore_io(&self.dir, e))?
        {
            let path = entry.path();
            let file_type =
                entry.file_type().await.map_err(|e| KeyringError::keystore_io(&path, e))?;
            if file_type.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(KEYSTORE_EXT) else { continue };
            let id_part = stem.split('.').next().unwrap_or_default();
            let Some(key_id) = KeyId::parse(id_part) else { continue };

            let root_key = self.load_file(&path, key_id).await?;
            keys.push(root_key);
        }
        Ok(keys)
    }

    async fn load_file(&self, path: &Path, expected_id: KeyId) -> Result<RootKey> {
        let raw = fs::read(path).await.map_err(|e| KeyringError::keystore_io(path, e))?;
        let wrapped: WrappedRootKey = serde_json::from_slice(&raw)
            .map_err(|e| KeyringError::keystore_invalid(path, format!("parse: {e}")))?;

        if wrapped.meta.key_id != expected_id {
            return Err(KeyringError::keystore_invalid(
                path,
                format!("embedded key ID {} must match the file name", wrapped.meta.key_id),
            ));
        }
        wrapped.meta.validate()?;

        let key_id = expected_id.to_string();
        let kek = (!wrapped.key_encryption_key.is_empty())
            .then(|| Zeroizing::new(wrapped.key_encryption_key.clone()));

        // Unknown providers fail here, before the KEK shape check, so a
        // record we have no adapter for reports itself as such.
        let wrapper = self.providers.wrapper(
            &wrapped.provider,
            &wrapped.provider_name,
            &key_id,
            kek.as_ref(),
        )?;

        let is_aead = wrapped.provider.is_empty() || wrapped.provider == PROVIDER_AEAD;
        if !is_aead && kek.is_some() {
            return Err(KeyringError::keystore_invalid(
                path,
                format!(
                    "provider {} is external but the record carries a key encryption key",
                    wrapped.provider
                ),
            ));
        }

        let key = wrapper.unwrap(&wrapped.encrypted_data_encryption_key).await?;
        let rsa_key = if wrapped.encrypted_rsa_key.is_empty() {
            None
        } else {
            Some(wrapper.unwrap(&wrapped.encrypted_rsa_key).await?.to_vec())
        };

        Ok(RootKey { meta: wrapped.meta, key: key.to_vec(), rsa_key })
    }

    /// Removes every file for the key ID. Missing files are not errors.
    pub async fn delete(&self, key_id: &KeyId) -> Result<()> {
        let id = key_id.to_string();
        let plain = format!("{id}{KEYSTORE_EXT}");
        let prefixed = format!("{id}.");

        let mut entries =
            fs::read_dir(&self.dir).await.map_err(|e| KeyringError::keystore_io(&self.dir, e))?;
        while let Some(entry) =
            entries.next_entry().await.map_err(|e| KeyringError::keystore_io(&self.dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name != plain && !(name.starts_with(&prefixed) && name.ends_with(KEYSTORE_EXT)) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => debug!(key = %key_id, file = name, "removed keystore file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(KeyringError::keystore_io(entry.path(), e)),
            }
        }
        Ok(())
    }
}

/// File name for a key under a provider: the plain extension for the
/// built-in AEAD provider, `.<provider>[.<name>]` prepended otherwise.
fn file_name(key_id: &KeyId, provider: &KekProviderConfig) -> String {
    if provider.provider.is_empty() || provider.provider == PROVIDER_AEAD {
        return format!("{key_id}{KEYSTORE_EXT}");
    }
    let mut ext = format!(".{}", provider.provider);
    if !provider.name.is_empty() {
        ext.push('.');
        ext.push_str(&provider.name);
    }
    format!("{key_id}{ext}{KEYSTORE_EXT}")
}

/// Writes `payload` to `path` via a temp file and rename, with
/// owner-only permissions.
async fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    let tmp = path.with_file_name(format!(
        "{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("key")
    ));

    fs::write(&tmp, payload).await.map_err(|e| KeyringError::keystore_io(&tmp, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| KeyringError::keystore_io(&tmp, e))?;
    }
    fs::rename(&tmp, path).await.map_err(|e| KeyringError::keystore_io(path, e))
}

#[cfg(test)]
mod tests {
    use rafter_kms::KmsError;

    use crate::types::KeyMeta;

    use super::*;

    async fn aead_keystore(dir: &Path) -> Keystore {
        Keystore::open(dir, ProviderConfigs::default()).await.unwrap()
    }

    fn aead_root_key() -> RootKey {
        RootKey::generate(KeyMeta::new(vec![KekProviderConfig::aead()]))
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = aead_keystore(dir.path()).await;

        let root_key = aead_root_key();
        store.save(&root_key).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, root_key.key);
        assert_eq!(loaded[0].meta.key_id, root_key.meta.key_id);
        assert!(loaded[0].rsa_key.is_none());
    }

    #[tokio::test]
    async fn round_trip_preserves_rsa_material() {
        let dir = tempfile::tempdir().unwrap();
        let store = aead_keystore(dir.path()).await;

        let root_key =
            RootKey::generate_with_rsa(KeyMeta::new(vec![KekProviderConfig::aead()])).unwrap();
        store.save(&root_key).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].rsa_key, root_key.rsa_key);
    }

    #[tokio::test]
    async fn file_is_named_for_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = aead_keystore(dir.path()).await;

        let root_key = aead_root_key();
        store.save(&root_key).await.unwrap();

        let expected = dir.path().join(format!("{}{KEYSTORE_EXT}", root_key.meta.key_id));
        assert!(expected.exists());
    }

    #[test]
    fn external_providers_extend_the_file_name() {
        let key_id = KeyId::generate();
        let provider = KekProviderConfig {
            provider: "transit".to_string(),
            name: "primary".to_string(),
            config: Default::default(),
        };
        assert_eq!(
            file_name(&key_id, &provider),
            format!("{key_id}.transit.primary{KEYSTORE_EXT}")
        );

        let unnamed = KekProviderConfig { provider: "transit".to_string(), ..Default::default() };
        assert_eq!(file_name(&key_id, &unnamed), format!("{key_id}.transit{KEYSTORE_EXT}"));
    }

    #[tokio::test]
    async fn load_skips_foreign_files_and_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let store = aead_keystore(dir.path()).await;
        store.save(&aead_root_key()).await.unwrap();

        std::fs::write(dir.path().join("README.md"), b"operator notes").unwrap();
        std::fs::write(dir.path().join("not-a-uuid.nks.json"), b"{}").unwrap();
        std::fs::create_dir(dir.path().join("backups")).unwrap();
        std::fs::write(dir.path().join("backups").join("stale.nks.json"), b"junk").unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn mismatched_file_name_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = aead_keystore(dir.path()).await;

        let root_key = aead_root_key();
        store.save(&root_key).await.unwrap();

        let from = dir.path().join(format!("{}{KEYSTORE_EXT}", root_key.meta.key_id));
        let to = dir.path().join(format!("{}{KEYSTORE_EXT}", KeyId::generate()));
        std::fs::rename(from, to).unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, KeyringError::KeystoreInvalid { .. }));
    }

    #[tokio::test]
    async fn aead_record_without_kek_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = aead_keystore(dir.path()).await;
        let root_key = aead_root_key();
        store.save(&root_key).await.unwrap();

        let path = dir.path().join(format!("{}{KEYSTORE_EXT}", root_key.meta.key_id));
        let mut record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        record.as_object_mut().unwrap().remove("key_encryption_key");
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, KeyringError::Kms(KmsError::MissingKek { .. })));
    }

    #[tokio::test]
    async fn external_record_with_kek_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Keystore::open(
            dir.path(),
            ProviderConfigs::new([KekProviderConfig {
                provider: "transit".to_string(),
                name: String::new(),
                config: [
                    ("address", "http://127.0.0.1:1"),
                    ("token", "t"),
                    ("key_name", "k"),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            }]),
        )
        .await
        .unwrap();

        // Fabricate a transit record that illegally carries a local KEK.
        let root_key = aead_root_key();
        let record = WrappedRootKey {
            meta: root_key.meta.clone(),
            encrypted_data_encryption_key: vec![1, 2, 3],
            encrypted_rsa_key: Vec::new(),
            key_encryption_key: vec![9; 32],
            provider: "transit".to_string(),
            provider_name: String::new(),
        };
        let path = dir.path().join(format!("{}.transit{KEYSTORE_EXT}", root_key.meta.key_id));
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, KeyringError::KeystoreInvalid { .. }));
    }

    #[tokio::test]
    async fn delete_removes_all_files_for_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = aead_keystore(dir.path()).await;

        let keep = aead_root_key();
        let gone = aead_root_key();
        store.save(&keep).await.unwrap();
        store.save(&gone).await.unwrap();

        store.delete(&gone.meta.key_id).await.unwrap();
        // Deleting a key with no files left is fine.
        store.delete(&gone.meta.key_id).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].meta.key_id, keep.meta.key_id);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn keystore_permissions_are_restrictive() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let keystore_dir = dir.path().join("keystore");
        let store = Keystore::open(&keystore_dir, ProviderConfigs::default()).await.unwrap();

        let root_key = aead_root_key();
        store.save(&root_key).await.unwrap();

        let dir_mode = std::fs::metadata(&keystore_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file = keystore_dir.join(format!("{}{KEYSTORE_EXT}", root_key.meta.key_id));
        let file_mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
