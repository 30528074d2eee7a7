use crate::journal::{self, JournalWriter};
use crate::mem::JournalEvent;
use crate::snapshot;
use crate::{InMemoryStore, Storage};
use chrono::Utc;
use picshare_core::{
    NewPicture, NewUser, Page, Picture, PictureId, PictureSearch, PictureSort, PictureWithMeta,
    Rating, RatingValue, Result, StoreError, User, UserId, UserPictureCount, UserSearch, UserSort,
    UsersByPictureFilter,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

const SEGMENT_BYTES: u64 = 256 * 1024 * 1024;

// Mutations commit to memory first, then their records are fsynced before
// the call returns. The journal lock is taken before the in-memory commit
// so segment file order matches sequence order.
pub struct PersistentStore {
    mem: InMemoryStore,
    journal: Mutex<JournalWriter>,
    data_dir: PathBuf,
}

impl PersistentStore {
    pub fn open(data_dir: PathBuf) -> std::io::Result<Self> {
        let journal = JournalWriter::open(&data_dir, SEGMENT_BYTES)?;
        let manifest = journal.manifest();
        let mem = InMemoryStore::new();
        // newest snapshot first, then journal records past its bookmark
        let bookmark = match &manifest.current_snapshot {
            Some(snap) => {
                let path = data_dir.join("snapshots").join(snap);
                match snapshot::read_snapshot(&path) {
                    Ok(records) => {
                        let seq = manifest.snapshot_bookmark.unwrap_or(0);
                        for rec in records {
                            mem.apply_record(seq, rec);
                        }
                        seq
                    }
                    Err(e) => {
                        tracing::warn!(snapshot = %snap, error = %e, "snapshot unreadable; replaying full journal");
                        0
                    }
                }
            }
            None => 0,
        };
        for (seq, rec) in journal::replay(&data_dir)? {
            if seq > bookmark {
                mem.apply_record(seq, rec);
            }
        }
        Ok(Self {
            mem,
            journal: Mutex::new(journal),
            data_dir,
        })
    }
}

async fn append_events(journal: &JournalWriter, events: Vec<JournalEvent>) -> Result<()> {
    let ts = Utc::now().timestamp();
    for (seq, body) in events {
        journal
            .append(seq, ts, &body)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl Storage for PersistentStore {
    async fn create_user(&self, req: NewUser) -> Result<User> {
        let journal = self.journal.lock().await;
        let (user, events) = self.mem.insert_user(req)?;
        append_events(&journal, events).await?;
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<User> {
        self.mem.get_user(id).await
    }

    async fn count_users(&self) -> Result<usize> {
        self.mem.count_users().await
    }

    async fn search_users(&self, q: UserSearch, sort: UserSort, page: Page) -> Result<Vec<User>> {
        self.mem.search_users(q, sort, page).await
    }

    async fn create_picture(&self, owner: UserId, req: NewPicture) -> Result<PictureWithMeta> {
        let journal = self.journal.lock().await;
        let (picture, events) = self.mem.insert_picture(owner, req)?;
        append_events(&journal, events).await?;
        Ok(picture)
    }

    async fn get_picture(&self, id: PictureId) -> Result<PictureWithMeta> {
        self.mem.get_picture(id).await
    }

    async fn list_pictures(&self, page: Page) -> Result<Vec<PictureWithMeta>> {
        self.mem.list_pictures(page).await
    }

    async fn delete_picture(&self, id: PictureId) -> Result<()> {
        let journal = self.journal.lock().await;
        let events = self.mem.remove_picture(id)?;
        append_events(&journal, events).await
    }

    async fn set_description(&self, id: PictureId, description: Option<String>) -> Result<Picture> {
        let journal = self.journal.lock().await;
        let (picture, events) = self.mem.update_description(id, description)?;
        append_events(&journal, events).await?;
        Ok(picture)
    }

    async fn search_pictures(
        &self,
        q: PictureSearch,
        sort: PictureSort,
        page: Page,
    ) -> Result<Vec<PictureWithMeta>> {
        self.mem.search_pictures(q, sort, page).await
    }

    async fn users_by_picture(&self, f: UsersByPictureFilter) -> Result<Vec<UserPictureCount>> {
        self.mem.users_by_picture(f).await
    }

    async fn upsert_rating(
        &self,
        picture_id: PictureId,
        user_id: UserId,
        value: RatingValue,
    ) -> Result<Rating> {
        let journal = self.journal.lock().await;
        let (rating, events) = self.mem.put_rating(picture_id, user_id, value)?;
        append_events(&journal, events).await?;
        Ok(rating)
    }

    async fn delete_rating(&self, picture_id: PictureId, user_id: UserId) -> Result<bool> {
        let journal = self.journal.lock().await;
        let (removed, events) = self.mem.remove_rating(picture_id, user_id)?;
        append_events(&journal, events).await?;
        Ok(removed)
    }

    async fn picture_ratings(&self, picture_id: PictureId) -> Result<BTreeMap<UserId, u8>> {
        self.mem.picture_ratings(picture_id).await
    }

    async fn average_rating(&self, picture_id: PictureId) -> Result<Option<f64>> {
        self.mem.average_rating(picture_id).await
    }

    async fn admin_snapshot(&self) -> Result<(String, u64)> {
        let (last, records) = self.mem.export_with_seq();
        let name = format!("snap-{}.zst", ulid::Ulid::new());
        let path = self.data_dir.join("snapshots").join(&name);
        snapshot::write_snapshot(&path, &records)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let journal = self.journal.lock().await;
        journal
            .set_snapshot(name.clone(), last)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok((name, last))
    }

    async fn admin_manifest(&self) -> Result<serde_json::Value> {
        let m = self.journal.lock().await.manifest();
        serde_json::to_value(m).map_err(|e| StoreError::Internal(e.to_string()))
    }

    async fn admin_trim_journal(&self, snapshot_id: &str) -> Result<Vec<String>> {
        let journal = self.journal.lock().await;
        journal.trim_segments(snapshot_id).map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidInput => StoreError::Invalid(e.to_string()),
            _ => StoreError::Internal(e.to_string()),
        })
    }
}
