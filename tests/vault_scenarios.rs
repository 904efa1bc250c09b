use std::fs;
use std::path::Path;

use cardvault::{
    assets::AssetManager,
    crypto::{MasterKey, SecretCrypto},
    domain::{Barcode, BarcodeType, Credential, CredentialField},
    file_cipher::FileCipher,
    images::ImageCodec,
    kv::{MemoryKv, SqliteKv},
    service::{LazyStore, VaultService},
};
use image::{ImageFormat, Rgba, RgbaImage};

fn key() -> MasterKey {
    MasterKey::from_bytes([11u8; 32])
}

fn sqlite_vault(root: &Path) -> VaultService<SqliteKv> {
    let crypto = SecretCrypto::new(key());
    let codec = ImageCodec::new(root.join("data/images"), FileCipher::new(crypto.clone()));
    VaultService::new(
        LazyStore::sqlite(root.join("data/vault.db"), crypto),
        AssetManager::new(codec, root.join("cache/images")),
    )
}

fn capture_png(vault: &VaultService<impl cardvault::kv::KeyValueStore>, c: &Credential) -> std::path::PathBuf {
    let path = vault.assets().scratch_path_for(c.id, "png");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbaImage::from_pixel(12, 8, Rgba([0, 120, 255, 255]))
        .save_with_format(&path, ImageFormat::Png)
        .unwrap();
    path
}

#[tokio::test]
async fn gym_card_roundtrips_through_the_store() {
    let root = tempfile::tempdir().unwrap();
    let vault = sqlite_vault(root.path());

    let mut card = vault.new_credential("Gym Card").await.unwrap();
    card.labels.insert("Fitness".into());
    card.labels.insert("New".into());
    card.fields.push(CredentialField {
        name: "Member ID".into(),
        value: "12345".into(),
        secret: false,
    });
    card.barcode = Some(Barcode {
        code: "998877".into(),
        kind: BarcodeType::QrCode,
        show_text: true,
    });
    vault.save(&mut card).await.unwrap();

    let loaded = vault.load(card.id).await.unwrap();
    assert_eq!(loaded, card);
    assert_eq!(loaded.name, "Gym Card");
    assert!(loaded.image_paths.is_empty());

    let labels = vault.labels().await.unwrap();
    let new = labels.iter().position(|l| l == "New").unwrap();
    let fitness = labels.iter().position(|l| l == "Fitness").unwrap();
    assert!(new < fitness);
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_removes_both_permanent_images() {
    let root = tempfile::tempdir().unwrap();
    let vault = sqlite_vault(root.path());

    let mut card = vault.new_credential("Library Card").await.unwrap();
    let front = capture_png(&vault, &card);
    let back = capture_png(&vault, &card);
    card.image_paths = vec![front.clone(), back.clone()];

    let outcome = vault.save(&mut card).await.unwrap();
    assert_eq!(outcome.images_migrated, 2);
    let permanent = card.image_paths.clone();
    for path in &permanent {
        assert!(vault.assets().codec().is_encrypted_at_rest(path));
        assert!(path.exists());
    }

    let (shown, batch) = vault.load_for_display(card.id).await.unwrap();
    assert_eq!(batch.images.len(), 2);
    assert!(batch.notices.is_empty());
    assert_eq!(shown.image_paths, permanent);

    assert!(vault.delete(card.id).await.unwrap());
    for path in &permanent {
        assert!(!path.exists());
    }
    let ids = vault.store().await.unwrap().list_ids().await.unwrap();
    assert!(!ids.contains(&card.id));

    // scratch originals are only removed by the sweep
    assert!(front.exists() && back.exists());
    assert_eq!(vault.sweep_scratch(std::time::Duration::ZERO), 2);
}

#[tokio::test]
async fn missing_image_is_dropped_on_display() {
    let root = tempfile::tempdir().unwrap();
    let crypto = SecretCrypto::new(key());
    let codec = ImageCodec::new(root.path().join("files"), FileCipher::new(crypto));
    let vault = VaultService::new(
        LazyStore::ready(MemoryKv::new()),
        AssetManager::new(codec, root.path().join("cache")),
    );

    let mut card = vault.new_credential("Coffee").await.unwrap();
    card.image_paths.push(capture_png(&vault, &card));
    vault.save(&mut card).await.unwrap();
    fs::remove_file(&card.image_paths[0]).unwrap();

    let (shown, batch) = vault.load_for_display(card.id).await.unwrap();
    assert!(shown.image_paths.is_empty());
    assert_eq!(batch.notices.len(), 1);
    assert_eq!(
        batch.notices[0].kind(),
        cardvault::error::ImageErrorKind::FileNotFound
    );
    assert!(vault.load(card.id).await.unwrap().image_paths.is_empty());
}

#[tokio::test]
async fn cards_with_same_photo_name_keep_their_own_images() {
    let root = tempfile::tempdir().unwrap();
    let vault = sqlite_vault(root.path());
    let mut saved = Vec::new();
    for (name, dir) in [("Card A", "a"), ("Card B", "b")] {
        let photo = root.path().join(dir).join("photo.png");
        fs::create_dir_all(photo.parent().unwrap()).unwrap();
        RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255]))
            .save_with_format(&photo, ImageFormat::Png)
            .unwrap();
        let mut card = vault.new_credential(name).await.unwrap();
        card.image_paths.push(photo);
        vault.save(&mut card).await.unwrap();
        saved.push(card);
    }
    assert_ne!(saved[0].image_paths, saved[1].image_paths);

    assert!(vault.delete(saved[1].id).await.unwrap());
    assert!(saved[0].image_paths[0].exists());
    let (_, batch) = vault.load_for_display(saved[0].id).await.unwrap();
    assert_eq!(batch.images.len(), 1);
    assert!(batch.notices.is_empty());
}

#[tokio::test]
async fn records_survive_reopening() {
    let root = tempfile::tempdir().unwrap();
    let id = {
        let vault = sqlite_vault(root.path());
        let mut card = vault.new_credential("Bank").await.unwrap();
        card.fields.push(CredentialField {
            name: "PIN".into(),
            value: "0000".into(),
            secret: true,
        });
        vault.save(&mut card).await.unwrap();
        card.id
    };

    let vault = sqlite_vault(root.path());
    let loaded = vault.load(id).await.unwrap();
    assert_eq!(loaded.fields[0].value, "0000");
    assert!(loaded.fields[0].secret);
}
