use std::path::{Path, PathBuf};

use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as b64, Engine};
use clap::{Parser, Subcommand};
use hmac::{Hmac, Mac};
use picshare_storage::journal::{self, RecBody};
use picshare_storage::{snapshot, InMemoryStore};
use sha2::Sha256;

#[derive(Parser)]
#[command(name = "picshare")]
#[command(about="Picshare admin CLI", long_about=None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    Restore {
        data_dir: PathBuf,
        out: PathBuf,
        #[arg(long)]
        dump: Option<PathBuf>,
    },
    DumpJournal { data_dir: PathBuf },
    Token {
        #[arg(long, default_value = "active")]
        kid: String,
        #[arg(long)]
        secret: String,
        // user id the token authenticates as
        #[arg(long)]
        sub: i64,
        #[arg(long, default_value_t = 3600)]
        ttl_secs: i64,
    },
}

// Same merge order as the server at startup: snapshot rows first, then the
// journal records past the snapshot bookmark.
fn restore(data_dir: &Path) -> Result<(InMemoryStore, u64)> {
    let manifest = journal::read_manifest(data_dir)?;
    let store = InMemoryStore::new();
    let mut bookmark = 0u64;
    if let (Some(snap), Some(mark)) = (&manifest.current_snapshot, manifest.snapshot_bookmark) {
        let path = data_dir.join("snapshots").join(snap);
        for rec in snapshot::read_snapshot(&path)? {
            store.apply_record(mark, rec);
        }
        bookmark = mark;
    }
    let mut last = bookmark;
    for (seq, rec) in journal::replay(data_dir)? {
        if seq > bookmark {
            last = last.max(seq);
            store.apply_record(seq, rec);
        }
    }
    Ok((store, last))
}

fn counts(records: &[RecBody]) -> (usize, usize, usize, usize) {
    let (mut users, mut tags, mut pictures, mut ratings) = (0, 0, 0, 0);
    for rec in records {
        match rec {
            RecBody::PutUser { .. } => users += 1,
            RecBody::PutTag { .. } => tags += 1,
            RecBody::PutPicture { .. } => pictures += 1,
            RecBody::PutRating { .. } => ratings += 1,
            _ => {}
        }
    }
    (users, tags, pictures, ratings)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Restore {
            data_dir,
            out,
            dump,
        } => {
            let (store, last_seq) = restore(&data_dir)?;
            let (_, records) = store.export_with_seq();
            let (users, tags, pictures, ratings) = counts(&records);
            if let Some(path) = dump {
                let mut lines = String::new();
                for rec in &records {
                    lines.push_str(&serde_json::to_string(rec)?);
                    lines.push('\n');
                }
                std::fs::write(path, lines)?;
            }
            let report = serde_json::json!({
                "last_seq": last_seq,
                "users": users,
                "tags": tags,
                "pictures": pictures,
                "ratings": ratings,
            });
            std::fs::write(out, serde_json::to_vec_pretty(&report)?)?;
        }
        Cmd::DumpJournal { data_dir } => {
            for (seq, rec) in journal::replay(&data_dir)? {
                println!("{}", serde_json::json!({"seq": seq, "record": rec}));
            }
        }
        Cmd::Token {
            kid,
            secret,
            sub,
            ttl_secs,
        } => {
            let claims = serde_json::json!({
                "sub": sub,
                "exp": chrono::Utc::now().timestamp() + ttl_secs,
                "jti": ulid::Ulid::new().to_string(),
            });
            let payload = serde_json::to_vec(&claims)?;
            let mut mac = <Hmac<Sha256>>::new_from_slice(secret.as_bytes())
                .map_err(|e| anyhow::anyhow!("bad signing key: {e}"))?;
            mac.update(&payload);
            let sig = mac.finalize().into_bytes();
            println!("{kid}.{}.{}", b64.encode(payload), b64.encode(sig));
        }
    }
    Ok(())
}
