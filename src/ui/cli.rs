use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Parser, Subcommand};
use log::{debug, info, warn};
use rpassword::prompt_password;
use tabled::{Table, settings::Style};

use crate::{
    config::Config,
    crypto::MasterKey,
    domain::{Barcode, BarcodeType, Credential, CredentialField},
    keymgr::{MasterKeyProvider, MasterKeySource},
    kv::SqliteKv,
    service::{SaveOutcome, VaultService},
    ui::{
        common::{CredentialRow, format_color, mask, parse_color},
        display_init_result,
    },
};

#[derive(Parser, Debug)]
#[command(
    name = "cardvault",
    version,
    about = "Keep payment cards, loyalty cards and passwords in a local encrypted vault"
)]
pub struct Cli {
    /// Override the permanent data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the scratch directory for captured images
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Do not use the OS keyring for the vault key
    #[arg(long, global = true, default_value_t = false)]
    pub no_keyring: bool,

    /// Provide the vault key (base64) explicitly; skips keyring lookup
    #[arg(long, global = true)]
    pub key: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Create the vault and its key
    Init,

    /// Add a credential
    Add {
        name: String,
        /// `#RRGGBB` or `AARRGGBB`
        #[arg(long)]
        color: Option<String>,
        #[arg(long = "label")]
        labels: Vec<String>,
        /// `NAME=VALUE`, shown in clear
        #[arg(long = "field")]
        fields: Vec<String>,
        /// Field name whose value is prompted for and kept hidden
        #[arg(long = "secret-field")]
        secret_fields: Vec<String>,
        #[arg(long)]
        barcode: Option<String>,
        #[arg(long, default_value = "QR_CODE")]
        barcode_type: String,
        /// Render the barcode text next to the glyph
        #[arg(long, action = ArgAction::SetTrue)]
        barcode_text: bool,
        /// Image file to attach (front, back, ...)
        #[arg(long = "image")]
        images: Vec<PathBuf>,
    },

    /// Attach an image to an existing credential
    Attach { id: u32, image: PathBuf },

    /// Remove the image at INDEX from a credential
    Detach { id: u32, index: usize },

    /// Show one credential
    Show {
        id: u32,
        /// Print secret field values in clear
        #[arg(long, action = ArgAction::SetTrue)]
        reveal: bool,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },

    /// List all credentials
    List,

    /// List every label in use
    Labels,

    /// Remove a credential and its images
    Rm { id: u32 },

    /// Delete stale scratch images
    Sweep {
        /// Ignore the age threshold
        #[arg(long, action = ArgAction::SetTrue)]
        all: bool,
    },

    /// Print an example config file
    ConfigExample,
}

pub async fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::ConfigExample = cli.command {
        println!("# {}", Config::config_file_path()?.display());
        println!("{}", Config::generate_example_config()?);
        return Ok(());
    }

    let config = Config::build(
        cli.data_dir.clone(),
        cli.cache_dir.clone(),
        MasterKeySource {
            base64_inline: cli.key.clone(),
            allow_keyring: !cli.no_keyring,
        },
    )?;
    let provider = MasterKeyProvider::new(
        config.master_key_source.clone(),
        config.keyring_service.clone(),
        config.keyring_account.clone(),
    );

    if let Commands::Init = cli.command {
        if config.db_path().exists() {
            bail!("vault already exists at {}", config.db_path().display());
        }
        let master_key = provider.generate()?;
        let service = VaultService::from_config(&config, master_key.clone());
        service.store().await.context("creating vault database")?;
        display_init_result(&config, &provider, &master_key);
        return Ok(());
    }

    let master_key = provider.obtain()?;
    let service = open_vault(&config, master_key);
    run_command(&service, &config, cli.command).await
}

/// Opens the vault and sweeps scratch images older than the configured age.
fn open_vault(config: &Config, master_key: MasterKey) -> VaultService<SqliteKv> {
    info!("opening vault at {}", config.data_dir.display());
    let service = VaultService::from_config(config, master_key);
    let swept = service.sweep_scratch(config.scratch_max_age);
    debug!("startup sweep removed {swept} scratch images");
    service
}

fn report_dropped(outcome: &SaveOutcome) {
    for notice in &outcome.notices {
        eprintln!("⚠️  dropped: {notice}");
    }
}

async fn run_command(
    service: &VaultService<SqliteKv>,
    config: &Config,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Init | Commands::ConfigExample => {
            unreachable!("handled before the vault is opened")
        }

        Commands::Add {
            name,
            color,
            labels,
            fields,
            secret_fields,
            barcode,
            barcode_type,
            barcode_text,
            images,
        } => {
            if name.trim().is_empty() {
                bail!("name must not be empty");
            }
            let mut credential = service.new_credential(name).await?;
            if let Some(color) = color {
                credential.color =
                    parse_color(&color).ok_or_else(|| anyhow!("invalid color '{color}'"))?;
            }
            credential.labels.extend(labels.into_iter().filter(|l| !l.is_empty()));
            for field in fields {
                let (name, value) = field
                    .split_once('=')
                    .ok_or_else(|| anyhow!("field '{field}' must look like NAME=VALUE"))?;
                credential.fields.push(CredentialField {
                    name: name.to_string(),
                    value: value.to_string(),
                    secret: false,
                });
            }
            for name in secret_fields {
                let value = prompt_password(format!("{name}: "))?;
                credential.fields.push(CredentialField {
                    name,
                    value,
                    secret: true,
                });
            }
            if let Some(code) = barcode {
                credential.barcode = Some(Barcode {
                    code,
                    kind: barcode_type.parse::<BarcodeType>()?,
                    show_text: barcode_text,
                });
            }
            for image in &images {
                match service.assets().import_to_scratch(image, credential.id) {
                    Ok(path) => credential.image_paths.push(path),
                    Err(e) => {
                        service.cancel(&credential);
                        return Err(e.into());
                    }
                }
            }

            let outcome = service.save(&mut credential).await?;
            report_dropped(&outcome);
            info!(
                "saved credential {} with {} images",
                credential.id, outcome.images_migrated
            );
            println!("✅ saved: {} (id {})", credential.name, credential.id);
        }

        Commands::Attach { id, image } => {
            let mut credential = service.load(id).await?;
            let path = service.assets().import_to_scratch(&image, id)?;
            credential.image_paths.push(path);
            let outcome = service.save(&mut credential).await?;
            report_dropped(&outcome);
            println!("✅ attached {} to {}", image.display(), credential.name);
        }

        Commands::Detach { id, index } => {
            let mut credential = service.load(id).await?;
            if index >= credential.image_paths.len() {
                bail!(
                    "credential {id} has {} images",
                    credential.image_paths.len()
                );
            }
            credential.image_paths.remove(index);
            let outcome = service.save(&mut credential).await?;
            report_dropped(&outcome);
            println!(
                "✅ detached image {index} ({} file removed)",
                outcome.orphans_removed
            );
        }

        Commands::Show { id, reveal, json } => {
            let (mut credential, batch) = service.load_for_display(id).await?;
            if reveal {
                warn!("credential {} printed with secrets in clear", id);
            } else {
                for field in credential.fields.iter_mut().filter(|f| f.secret) {
                    field.value = mask(&field.value);
                }
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&credential)?);
            } else {
                print_credential(&credential);
                for image in &batch.images {
                    println!(
                        "  image: {} ({}x{})",
                        image.path.display(),
                        image.image.width(),
                        image.image.height()
                    );
                }
            }
            for notice in &batch.notices {
                eprintln!("⚠️  {notice}");
            }
        }

        Commands::List => {
            let credentials = service.list().await?;
            let rows: Vec<CredentialRow> = credentials.iter().map(CredentialRow::from).collect();
            let count = rows.len();
            let mut table = Table::new(rows);
            table.with(Style::rounded());

            info!("listed {} credentials", count);
            println!("{}", table);
        }

        Commands::Labels => {
            for label in service.labels().await? {
                println!("{label}");
            }
        }

        Commands::Rm { id } => {
            if service.delete(id).await? {
                println!("✅ deleted: {}", id);
            } else {
                println!("nothing stored under {}", id);
            }
        }

        Commands::Sweep { all } => {
            let max_age = if all {
                Duration::ZERO
            } else {
                config.scratch_max_age
            };
            let removed = service.sweep_scratch(max_age);
            println!("✅ removed {removed} scratch images");
        }
    }

    Ok(())
}

fn print_credential(c: &Credential) {
    println!("{} (id {})", c.name, c.id);
    println!("  color: {}", format_color(c.color));
    println!("  created: {}", c.created_at.to_rfc3339());
    println!("  updated: {}", c.updated_at.to_rfc3339());
    if !c.labels.is_empty() {
        println!("  labels: {}", c.sorted_labels().join(", "));
    }
    for field in &c.fields {
        println!("  {}: {}", field.name, field.value);
    }
    if let Some(barcode) = &c.barcode {
        let text = if barcode.show_text {
            barcode.code.as_str()
        } else {
            "(hidden)"
        };
        println!("  barcode: {} {}", barcode.kind, text);
    }
}
