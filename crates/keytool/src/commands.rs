//! Subcommand implementations. Output goes to the supplied writer.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use common::{KeyTemplate, KeysetError};
use fields::store::KeyRecord;
use fields::{Aead, DatabaseKeyset, KeysetHandle, KeysetManager, KeysetStore};
use tracing::info;

use crate::cli::Command;

/// Run one subcommand.
pub fn execute(command: &Command, manager: &KeysetManager, out: &mut impl Write) -> Result<()> {
    match command {
        Command::CreateKeyset { name, template } => create_keyset(manager, name, template, out),
        Command::CreateKey { name, template } => create_key(manager, name, template, out),
        Command::PromoteKey { name, id } => promote_key(manager, name, *id, out),
        Command::ListKeys { name } => list_keys(manager, name, out),
        Command::DeleteKeyset { name } => delete_keyset(manager, name, out),
        Command::UnsafeExportKeyset { name } => {
            let keyset = open(manager, name)?.export_keyset()?;
            writeln!(out, "{}", keyset.to_json()?)?;
            Ok(())
        }
        Command::ExportKeysetInfo { name } => {
            let info = open(manager, name)?.export_keyset_info()?;
            writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
            Ok(())
        }
        Command::GenerateKeyset {
            template,
            out: path,
            master_key,
        } => generate_keyset(template, path, master_key.as_deref(), out),
        Command::ListTemplates => {
            for t in KeyTemplate::all() {
                writeln!(
                    out,
                    "{}\t{}\t{}",
                    t.name,
                    t.family().describe(),
                    t.output_prefix_type.as_str()
                )?;
            }
            Ok(())
        }
    }
}

/// Whether a subcommand reads or writes the keyset store.
pub fn needs_store(command: &Command) -> bool {
    !matches!(
        command,
        Command::GenerateKeyset { .. } | Command::ListTemplates
    )
}

fn template(name: &str) -> Result<KeyTemplate> {
    Ok(KeyTemplate::from_name(name)?)
}

fn store_parts(manager: &KeysetManager) -> Result<(Arc<dyn KeysetStore>, Arc<dyn Aead>)> {
    let store = manager.store().context("no keyset store configured")?;
    Ok((store, manager.protection_aead()?))
}

fn open(manager: &KeysetManager, name: &str) -> Result<DatabaseKeyset> {
    let (store, protection) = store_parts(manager)?;
    Ok(DatabaseKeyset::open(store, protection, name)?)
}

fn create_keyset(manager: &KeysetManager, name: &str, template_name: &str, out: &mut impl Write) -> Result<()> {
    let template = template(template_name)?;
    let (store, protection) = store_parts(manager)?;
    DatabaseKeyset::create(store, protection, name, &template)?;
    writeln!(out, "Created keyset {name}")?;
    Ok(())
}

fn create_key(manager: &KeysetManager, name: &str, template_name: &str, out: &mut impl Write) -> Result<()> {
    let template = template(template_name)?;
    let key = open(manager, name)?.generate_key(&template)?;
    writeln!(out, "Created key {}", key.id)?;
    Ok(())
}

fn promote_key(manager: &KeysetManager, name: &str, id: u32, out: &mut impl Write) -> Result<()> {
    open(manager, name)?.set_primary_key(id)?;
    writeln!(out, "Key {id} promoted to primary")?;
    Ok(())
}

fn list_keys(manager: &KeysetManager, name: &str, out: &mut impl Write) -> Result<()> {
    let keyset = open(manager, name)?;
    let primary = keyset.primary_key_id()?;
    let keys: Vec<KeyRecord> = keyset.keys()?;
    let type_url = keys.first().map(|k| k.type_url.as_str()).unwrap_or("-");

    writeln!(out, "Key type: {type_url}")?;
    writeln!(out)?;
    writeln!(out, "ID\tPrimary\tStatus\tPrefix")?;
    for key in &keys {
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            key.id,
            if Some(key.id) == primary { "Y" } else { "N" },
            key.status.as_str(),
            key.output_prefix_type.as_str()
        )?;
    }
    Ok(())
}

fn delete_keyset(manager: &KeysetManager, name: &str, out: &mut impl Write) -> Result<()> {
    let store = manager.store().context("no keyset store configured")?;
    store.delete_keyset(name)?;
    info!(keyset = %name, "keyset deleted");
    writeln!(out, "Deleted keyset \"{name}\"")?;
    Ok(())
}

fn generate_keyset(
    template_name: &str,
    path: &Path,
    master_key: Option<&Path>,
    out: &mut impl Write,
) -> Result<()> {
    let handle = KeysetHandle::generate(&template(template_name)?);
    let json = match master_key {
        Some(master_path) => {
            let master_json = std::fs::read_to_string(master_path)
                .with_context(|| format!("failed to read master key {}", master_path.display()))?;
            let master = KeysetHandle::read_cleartext(&master_json)?.aead()?;
            handle.write_encrypted(&master)?
        }
        None => handle.write_cleartext()?,
    };
    let mut file = create_new(path).map_err(|e| match e.kind() {
        ErrorKind::AlreadyExists => anyhow::Error::from(KeysetError::ImproperlyConfigured(format!(
            "refusing to overwrite existing file {}",
            path.display()
        ))),
        _ => anyhow::Error::from(e).context(format!("failed to create {}", path.display())),
    })?;
    file.write_all(json.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), template = template_name, "keyset file written");
    writeln!(
        out,
        "Wrote keyset {} with primary key {}",
        path.display(),
        handle.keyset().primary_key_id
    )?;
    Ok(())
}

/// Create `path` for writing, failing if it exists. Keyset files are
/// owner-only on unix.
fn create_new(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}
