//! ALFA Docs Vault - CLI
//!
//! Command-line storage collaborator: keeps blobs, key handles and the
//! rotation schedule in a vault directory and drives the vault core.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use alfa_docs_vault::auth::{AuthorizationToken, JsonGateStore};
use alfa_docs_vault::crypto::{SealParams, SealedFileKeyStore};
use alfa_docs_vault::rotation::RotationSchedule;
use alfa_docs_vault::secure_fs::{write_atomic, write_streamed, SecureFs};
use alfa_docs_vault::sync::{
    CommitOutcome, ConflictStore, JsonRecordSink, ManualChoice, ResolutionCommitter, VersionPair,
};
use alfa_docs_vault::{Clock, DocumentKeyHandle, SystemClock, VaultCore, VaultCoreConfig};

#[derive(Parser)]
#[command(name = "alfa-docs")]
#[command(author = "Karen Tonoyan")]
#[command(version = alfa_docs_vault::VERSION)]
#[command(about = "ALFA Docs Vault - envelope-encrypted document vault")]
struct Cli {
    /// Vault path
    #[arg(short, long, default_value = "./docs_vault")]
    vault: PathBuf,

    /// Key store passphrase (falls back to ALFA_DOCS_PASSPHRASE)
    #[arg(long, global = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault and enroll a PIN
    Init {
        #[arg(short, long)]
        pin: String,
    },

    /// Encrypt a document into the vault
    Add {
        path: PathBuf,
        #[arg(short, long)]
        pin: String,
    },

    /// Decrypt a document to a file
    Open {
        id: Uuid,
        output: PathBuf,
        #[arg(short, long)]
        pin: String,
    },

    /// Permanently destroy a document (crypto-shred)
    Shred {
        id: Uuid,
        #[arg(short, long)]
        pin: String,
    },

    /// Rotate the master key
    Rotate {
        #[arg(short, long)]
        pin: String,
    },

    /// Show gate, rotation and document status
    Status,

    /// Sync conflict review
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// List conflicts awaiting review
    List,

    /// Resolve a version pair (JSON) delivered by the sync transport
    Import { pair: PathBuf },

    /// Pick the surviving version of a pending conflict
    Resolve {
        id: Uuid,
        #[arg(value_enum)]
        choice: Side,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Side {
    Local,
    Remote,
}

/// Document registry entry kept next to the blobs
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentEntry {
    name: String,
    plaintext_len: u64,
    blob_hash: String,
    added_at: DateTime<Utc>,
    handle: DocumentKeyHandle,
}

const KEYSTORE_FILE: &str = "keystore.json";
const GATE_FILE: &str = "gate.json";
const DOCUMENTS_FILE: &str = "documents.json";
const ROTATION_FILE: &str = "rotation.json";
const CONFIG_FILE: &str = "config.json";
const CONFLICTS_DB: &str = "conflicts.db";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = cli.vault;

    match cli.command {
        Commands::Init { pin } => {
            if root.join(KEYSTORE_FILE).exists() {
                bail!("vault already exists at {}", root.display());
            }
            println!("🔐 Creating new ALFA Docs Vault...");
            std::fs::create_dir_all(root.join("docs"))?;

            let passphrase = passphrase(cli.passphrase)?;
            let store = SealedFileKeyStore::open_or_create(
                &root.join(KEYSTORE_FILE),
                &passphrase,
                SealParams::default(),
            )?;
            let config = VaultCoreConfig::load_or_default(&root.join(CONFIG_FILE))?;
            let core = VaultCore::new(
                config,
                Arc::new(store),
                Arc::new(JsonGateStore::new(&root.join(GATE_FILE))),
                Arc::new(SystemClock),
            )?;
            core.gate().enroll_pin(&secret(pin))?;

            let session = Session::attach(root, core, Vec::new());
            session.save()?;
            println!("✅ Vault created at: {}", session.root.display());
        }

        Commands::Add { path, pin } => {
            let mut session = Session::open(&root, cli.passphrase)?;
            let token = session.unlock(pin)?;

            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("document")
                .to_string();

            let mut input = BufReader::new(File::open(&path).with_context(|| format!("reading {}", path.display()))?);
            let created = write_streamed(
                &session.fs.full_path("docs"),
                |output| session.core.create_document(&token, &mut input, output, None),
                |created| session.fs.full_path(&blob_path(&created.handle.key_id)),
            )?;

            let blob_rel = blob_path(&created.handle.key_id);
            let blob_hash = hash_file(&session.fs.full_path(&blob_rel))?;

            session.documents.push(DocumentEntry {
                name,
                plaintext_len: created.summary.plaintext_len,
                blob_hash,
                added_at: Utc::now(),
                handle: created.handle.clone(),
            });
            session.save()?;

            println!("✅ Document added with ID: {}", created.handle.key_id);
        }

        Commands::Open { id, output, pin } => {
            let session = Session::open(&root, cli.passphrase)?;
            let token = session.unlock(pin)?;
            let entry = session.entry(&id)?;

            let mut blob = BufReader::new(session.fs.open_file(&blob_path(&id))?);
            let plain = session.core.open_document(&token, &entry.handle, &mut blob, None)?;

            let mut reader = plain.reader()?;
            let mut out = File::create(&output)?;
            io::copy(&mut reader, &mut out)?;
            plain.release()?;

            println!("✅ {} decrypted to: {}", entry.name, output.display());
        }

        Commands::Shred { id, pin } => {
            let mut session = Session::open(&root, cli.passphrase)?;
            let token = session.unlock(pin)?;
            session.entry(&id)?;

            session.core.shred_document(&token, &id)?;
            session.documents.retain(|d| d.handle.key_id != id);
            session.save()?;
            session.fs.delete_file(&blob_path(&id))?;

            println!("🗑️ Document {} shredded", id);
        }

        Commands::Rotate { pin } => {
            let mut session = Session::open(&root, cli.passphrase)?;
            let token = session.unlock(pin)?;

            println!("🔄 Rotating master key...");
            let report = session.core.rotate_master_key(&token)?;
            for entry in session.documents.iter_mut() {
                if let Some(h) = report.handles.iter().find(|h| h.key_id == entry.handle.key_id) {
                    entry.handle = h.clone();
                }
            }
            session.save()?;

            println!(
                "✅ Master key v{} -> v{} ({} document keys re-wrapped, epoch {})",
                report.previous_version, report.new_version, report.rewrapped, report.epoch
            );
        }

        Commands::Status => {
            let session = Session::open(&root, cli.passphrase)?;
            let gate = session.core.gate().status();

            println!("📊 ALFA Docs Vault Status");
            println!("{:-<40}", "");
            println!("Gate state:        {:?}", gate.state);
            println!("Failed attempts:   {}", gate.consecutive_failures);
            if gate.retry_after_secs > 0 {
                println!("Locked for:        {} s (tier {})", gate.retry_after_secs, gate.tier);
            }
            println!("Documents:         {}", session.documents.len());
            if let Some(rotation) = session.core.key_manager().rotation_status() {
                println!("Master key:        v{} (epoch {})", rotation.master_version, rotation.epoch);
                println!("Next rotation:     {} days", rotation.days_remaining);
                if rotation.overdue {
                    println!("⚠️ Master key rotation overdue");
                } else if rotation.due_soon {
                    println!("⚠️ Master key rotation due soon");
                }
            }
            println!("Pending conflicts: {}", session.conflicts()?.pending_count()?);
        }

        Commands::Conflicts { command } => {
            let session = Session::open(&root, cli.passphrase)?;
            run_conflicts(&session, command)?;
        }
    }

    Ok(())
}

fn run_conflicts(session: &Session, command: ConflictCommands) -> Result<()> {
    let store = Arc::new(session.conflicts()?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let committer = ResolutionCommitter::new(
        Arc::new(JsonRecordSink::new(&session.root.join("records"))),
        store.clone(),
        clock,
    );

    match command {
        ConflictCommands::List => {
            let pending = store.pending()?;
            if pending.is_empty() {
                println!("📭 No pending conflicts");
            }
            for record in pending {
                println!(
                    "{} {} {} (local {} @ {}, remote {} @ {})",
                    record.id,
                    record.entity_type.as_str(),
                    record.entity_id,
                    record.local.version_id,
                    record.local.modified_at,
                    record.remote.version_id,
                    record.remote.modified_at
                );
            }
        }

        ConflictCommands::Import { pair } => {
            let data = std::fs::read(&pair).with_context(|| format!("reading {}", pair.display()))?;
            let pair: VersionPair = serde_json::from_slice(&data)?;

            let resolution = session.core.resolver().resolve(&pair)?;
            let strategy = resolution
                .strategy()
                .map(|s| s.as_str())
                .unwrap_or("unchanged");
            let outcome = committer.commit(&pair, &resolution)?;

            println!("🔀 {}: {} -> {}", pair.entity_id(), strategy, describe(&outcome));
        }

        ConflictCommands::Resolve { id, choice } => {
            let choice = match choice {
                Side::Local => ManualChoice::Local,
                Side::Remote => ManualChoice::Remote,
            };
            let outcome = committer.commit_manual(&id, choice)?;
            println!("✅ Conflict {}: {}", id, describe(&outcome));
        }
    }

    Ok(())
}

fn describe(outcome: &CommitOutcome) -> String {
    match outcome {
        CommitOutcome::Committed { version_id } => format!("committed {}", version_id),
        CommitOutcome::AlreadyCommitted => "already committed".into(),
        CommitOutcome::Deferred { conflict_id } => format!("pending review ({})", conflict_id),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// VAULT DIRECTORY
// ═══════════════════════════════════════════════════════════════════════════

struct Session {
    root: PathBuf,
    fs: SecureFs,
    core: VaultCore,
    documents: Vec<DocumentEntry>,
}

impl Session {
    fn attach(root: PathBuf, core: VaultCore, documents: Vec<DocumentEntry>) -> Self {
        Self {
            fs: SecureFs::new(&root),
            root,
            core,
            documents,
        }
    }

    fn open(root: &Path, passphrase_arg: Option<String>) -> Result<Self> {
        let keystore_path = root.join(KEYSTORE_FILE);
        if !keystore_path.exists() {
            bail!("no vault at {} (run `alfa-docs init`)", root.display());
        }

        let passphrase = passphrase(passphrase_arg)?;
        let store = SealedFileKeyStore::open(&keystore_path, &passphrase)?;
        let config = VaultCoreConfig::load_or_default(&root.join(CONFIG_FILE))?;
        let core = VaultCore::new(
            config,
            Arc::new(store),
            Arc::new(JsonGateStore::new(&root.join(GATE_FILE))),
            Arc::new(SystemClock),
        )?;

        let documents: Vec<DocumentEntry> = match std::fs::read(root.join(DOCUMENTS_FILE)) {
            Ok(data) => serde_json::from_slice(&data).context("documents.json is corrupt")?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        core.key_manager()
            .load_handles(documents.iter().map(|d| d.handle.clone()))?;

        let rotation_path = root.join(ROTATION_FILE);
        if rotation_path.exists() {
            let schedule: RotationSchedule = serde_json::from_slice(&std::fs::read(rotation_path)?)?;
            core.key_manager().restore_schedule(schedule);
        }

        Ok(Self::attach(root.to_path_buf(), core, documents))
    }

    fn unlock(&self, pin: String) -> Result<AuthorizationToken> {
        Ok(self.core.gate().submit_pin(&secret(pin))?)
    }

    fn entry(&self, id: &Uuid) -> Result<DocumentEntry> {
        match self.documents.iter().find(|d| d.handle.key_id == *id) {
            Some(entry) => Ok(entry.clone()),
            None => bail!("no document with ID {}", id),
        }
    }

    fn conflicts(&self) -> Result<ConflictStore> {
        Ok(ConflictStore::open(&self.root.join(CONFLICTS_DB))?)
    }

    fn save(&self) -> Result<()> {
        write_atomic(
            &self.root.join(DOCUMENTS_FILE),
            &serde_json::to_vec_pretty(&self.documents)?,
        )?;
        if let Some(schedule) = self.core.key_manager().schedule() {
            write_atomic(&self.root.join(ROTATION_FILE), &serde_json::to_vec_pretty(&schedule)?)?;
        }
        Ok(())
    }
}

fn blob_path(id: &Uuid) -> String {
    format!("docs/{}.blob", id)
}

fn secret(value: String) -> SecretString {
    SecretString::new(value)
}

fn passphrase(arg: Option<String>) -> Result<SecretString> {
    match arg.or_else(|| std::env::var("ALFA_DOCS_PASSPHRASE").ok()) {
        Some(p) if !p.is_empty() => Ok(secret(p)),
        _ => bail!("key store passphrase required (--passphrase or ALFA_DOCS_PASSPHRASE)"),
    }
}

fn hash_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
