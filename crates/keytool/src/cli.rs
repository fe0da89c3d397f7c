use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Key management for encrypted-field keysets.
#[derive(Parser, Debug)]
#[command(name = "keytool", version, propagate_version = true)]
pub struct Cli {
    /// TOML configuration file. Without it, configuration is read from
    /// `SEALFIELD_*` environment variables.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a keyset in the keyset store with one primary key.
    CreateKeyset { name: String, template: String },

    /// Create a non-primary key in a keyset.
    CreateKey { name: String, template: String },

    /// Promote a key to primary in a keyset.
    PromoteKey { name: String, id: u32 },

    /// List the keys of a keyset.
    ListKeys { name: String },

    /// Delete a keyset and all of its keys.
    DeleteKeyset { name: String },

    /// Export a keyset as JSON, INCLUDING KEY MATERIAL.
    UnsafeExportKeyset { name: String },

    /// Export keyset metadata as JSON.
    ExportKeysetInfo { name: String },

    /// Write a new keyset file.
    GenerateKeyset {
        template: String,

        #[arg(long)]
        out: PathBuf,

        /// Cleartext AEAD keyset used to encrypt the new keyset.
        #[arg(long)]
        master_key: Option<PathBuf>,
    },

    /// List the available key templates.
    ListTemplates,
}
