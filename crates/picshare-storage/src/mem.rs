use crate::journal::RecBody;
use crate::traits::Storage;
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use picshare_core::util::contains_ci;
use picshare_core::{
    NewPicture, NewUser, Page, Picture, PictureId, PictureSearch, PictureSort, PictureSortField,
    PictureWithMeta, Rating, RatingValue, Result, SortOrder, StoreError, Tag, TagId, User, UserId,
    UserPictureCount, UserSearch, UserSort, UserSortField, UsersByPictureFilter,
};
use prometheus::{register_histogram_vec, HistogramVec};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

static SEARCH_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!("store_search_seconds", "search latency", &["entity"]).unwrap()
});

// (journal sequence, record) emitted by a mutation, in apply order.
pub type JournalEvent = (u64, RecBody);

#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    pictures: HashMap<PictureId, Picture>,
    tags: HashMap<TagId, Tag>,
    // one rating per (picture, rater); this keying is the uniqueness constraint
    ratings: BTreeMap<(PictureId, UserId), Rating>,
    // case-folded uniqueness lookups
    users_by_name: HashMap<String, UserId>,
    users_by_email: HashMap<String, UserId>,
    tags_by_name: HashMap<String, TagId>,
    // picture<->tag association rows, kept in both directions
    picture_tags: BTreeSet<(PictureId, TagId)>,
    tag_pictures: BTreeSet<(TagId, PictureId)>,
    // last issued ids and the journal sequence
    last_user_id: i64,
    last_picture_id: i64,
    last_tag_id: i64,
    last_rating_id: i64,
    seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn tag_ids_for(&self, picture_id: PictureId) -> Vec<TagId> {
        self.picture_tags
            .range((picture_id, TagId::MIN)..=(picture_id, TagId::MAX))
            .map(|&(_, t)| t)
            .collect()
    }

    fn average_for(&self, picture_id: PictureId) -> Option<f64> {
        let mut sum = 0u32;
        let mut n = 0u32;
        for r in self
            .ratings
            .range((picture_id, UserId::MIN)..=(picture_id, UserId::MAX))
            .map(|(_, r)| r)
        {
            sum += u32::from(r.value.get());
            n += 1;
        }
        if n == 0 {
            None
        } else {
            Some(f64::from(sum) / f64::from(n))
        }
    }

    fn with_meta(&self, picture: &Picture) -> PictureWithMeta {
        PictureWithMeta {
            picture: picture.clone(),
            tags: self.tag_ids_for(picture.id),
            average_rating: self.average_for(picture.id),
        }
    }

    // Tag resolver: pictures carrying any tag whose name contains the
    // pattern, case-insensitive.
    fn pictures_tagged_like(&self, pattern: &str) -> HashSet<PictureId> {
        let mut out = HashSet::new();
        for tag in self.tags.values() {
            if contains_ci(&tag.name, pattern) {
                out.extend(
                    self.tag_pictures
                        .range((tag.id, PictureId::MIN)..=(tag.id, PictureId::MAX))
                        .map(|&(_, p)| p),
                );
            }
        }
        out
    }

    // Look up or create a tag row; creation emits a journal event.
    fn ensure_tag(&mut self, name: &str, events: &mut Vec<JournalEvent>) -> TagId {
        let folded = name.to_lowercase();
        if let Some(id) = self.tags_by_name.get(&folded) {
            return *id;
        }
        self.last_tag_id += 1;
        let tag = Tag {
            id: self.last_tag_id,
            name: name.to_string(),
        };
        self.tags_by_name.insert(folded, tag.id);
        self.tags.insert(tag.id, tag.clone());
        let seq = self.next_seq();
        events.push((seq, RecBody::PutTag { tag }));
        self.last_tag_id
    }

    // Drop a picture along with its association rows and ratings.
    fn purge_picture(&mut self, picture_id: PictureId) {
        self.pictures.remove(&picture_id);
        for t in self.tag_ids_for(picture_id) {
            self.picture_tags.remove(&(picture_id, t));
            self.tag_pictures.remove(&(t, picture_id));
        }
        let raters: Vec<UserId> = self
            .ratings
            .range((picture_id, UserId::MIN)..=(picture_id, UserId::MAX))
            .map(|(&(_, u), _)| u)
            .collect();
        for u in raters {
            self.ratings.remove(&(picture_id, u));
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn insert_user(&self, req: NewUser) -> Result<(User, Vec<JournalEvent>)> {
        let mut inner = self.inner.write();
        let name_key = req.username.trim().to_lowercase();
        let email_key = req.email.trim().to_lowercase();
        if name_key.is_empty() || email_key.is_empty() {
            return Err(StoreError::Invalid("username and email are required".into()));
        }
        // a first-account role claim only holds while the store is empty
        if req.bootstrap && !inner.users.is_empty() {
            return Err(StoreError::Conflict("users already exist".into()));
        }
        if inner.users_by_name.contains_key(&name_key) {
            return Err(StoreError::Conflict("username already taken".into()));
        }
        if inner.users_by_email.contains_key(&email_key) {
            return Err(StoreError::Conflict("email already registered".into()));
        }
        inner.last_user_id += 1;
        let user = User {
            id: inner.last_user_id,
            username: req.username.trim().to_string(),
            email: req.email.trim().to_string(),
            is_moderator: req.is_moderator,
            is_admin: req.is_admin,
            created_at: Utc::now(),
        };
        inner.users_by_name.insert(name_key, user.id);
        inner.users_by_email.insert(email_key, user.id);
        inner.users.insert(user.id, user.clone());
        let seq = inner.next_seq();
        Ok((user.clone(), vec![(seq, RecBody::PutUser { user })]))
    }

    pub fn insert_picture(
        &self,
        owner: UserId,
        req: NewPicture,
    ) -> Result<(PictureWithMeta, Vec<JournalEvent>)> {
        let mut inner = self.inner.write();
        if !inner.users.contains_key(&owner) {
            return Err(StoreError::UserNotFound);
        }
        if req.picture_url.trim().is_empty() {
            return Err(StoreError::Invalid("picture_url is required".into()));
        }
        let mut events = Vec::new();
        // dedupe tag names case-insensitively, keeping the first-seen casing
        let mut tag_ids = Vec::new();
        let mut seen = HashSet::new();
        for raw in &req.tags {
            let name = raw.trim();
            if name.is_empty() || !seen.insert(name.to_lowercase()) {
                continue;
            }
            let id = inner.ensure_tag(name, &mut events);
            tag_ids.push(id);
        }
        inner.last_picture_id += 1;
        let id = inner.last_picture_id;
        let picture = Picture::new(id, owner, req);
        inner.pictures.insert(id, picture.clone());
        for t in &tag_ids {
            inner.picture_tags.insert((id, *t));
            inner.tag_pictures.insert((*t, id));
        }
        let seq = inner.next_seq();
        events.push((
            seq,
            RecBody::PutPicture {
                picture: picture.clone(),
                tag_ids: tag_ids.clone(),
            },
        ));
        let meta = PictureWithMeta {
            picture,
            tags: tag_ids,
            average_rating: None,
        };
        Ok((meta, events))
    }

    pub fn update_description(
        &self,
        id: PictureId,
        description: Option<String>,
    ) -> Result<(Picture, Vec<JournalEvent>)> {
        let mut inner = self.inner.write();
        let pic = inner
            .pictures
            .get_mut(&id)
            .ok_or(StoreError::PictureNotFound)?;
        pic.description = description.clone();
        let picture = pic.clone();
        let seq = inner.next_seq();
        Ok((
            picture,
            vec![(
                seq,
                RecBody::SetDescription {
                    picture_id: id,
                    description,
                },
            )],
        ))
    }

    pub fn remove_picture(&self, id: PictureId) -> Result<Vec<JournalEvent>> {
        let mut inner = self.inner.write();
        if !inner.pictures.contains_key(&id) {
            return Err(StoreError::PictureNotFound);
        }
        inner.purge_picture(id);
        let seq = inner.next_seq();
        Ok(vec![(seq, RecBody::DeletePicture { picture_id: id })])
    }

    pub fn put_rating(
        &self,
        picture_id: PictureId,
        user_id: UserId,
        value: RatingValue,
    ) -> Result<(Rating, Vec<JournalEvent>)> {
        let mut inner = self.inner.write();
        if !inner.pictures.contains_key(&picture_id) {
            return Err(StoreError::PictureNotFound);
        }
        if !inner.users.contains_key(&user_id) {
            return Err(StoreError::UserNotFound);
        }
        // upsert keyed by (picture, rater); the row id survives re-rating
        let existing = inner.ratings.get(&(picture_id, user_id)).cloned();
        let rating = match existing {
            Some(mut r) => {
                r.value = value;
                inner.ratings.insert((picture_id, user_id), r.clone());
                r
            }
            None => {
                inner.last_rating_id += 1;
                let r = Rating {
                    id: inner.last_rating_id,
                    picture_id,
                    user_id,
                    value,
                    created_at: Utc::now(),
                };
                inner.ratings.insert((picture_id, user_id), r.clone());
                r
            }
        };
        let seq = inner.next_seq();
        Ok((rating.clone(), vec![(seq, RecBody::PutRating { rating })]))
    }

    pub fn remove_rating(
        &self,
        picture_id: PictureId,
        user_id: UserId,
    ) -> Result<(bool, Vec<JournalEvent>)> {
        let mut inner = self.inner.write();
        if !inner.pictures.contains_key(&picture_id) {
            return Err(StoreError::PictureNotFound);
        }
        if inner.ratings.remove(&(picture_id, user_id)).is_none() {
            return Ok((false, Vec::new()));
        }
        let seq = inner.next_seq();
        Ok((
            true,
            vec![(
                seq,
                RecBody::DeleteRating {
                    picture_id,
                    user_id,
                },
            )],
        ))
    }

    // Apply one journal or snapshot record. Advances id allocators and the
    // sequence counter so writes after a restore slot in above everything
    // already seen.
    pub fn apply_record(&self, seq: u64, rec: RecBody) {
        let mut inner = self.inner.write();
        inner.seq = inner.seq.max(seq);
        match rec {
            RecBody::PutUser { user } => {
                inner.last_user_id = inner.last_user_id.max(user.id);
                inner
                    .users_by_name
                    .insert(user.username.to_lowercase(), user.id);
                inner
                    .users_by_email
                    .insert(user.email.to_lowercase(), user.id);
                inner.users.insert(user.id, user);
            }
            RecBody::PutTag { tag } => {
                inner.last_tag_id = inner.last_tag_id.max(tag.id);
                inner.tags_by_name.insert(tag.name.to_lowercase(), tag.id);
                inner.tags.insert(tag.id, tag);
            }
            RecBody::PutPicture { picture, tag_ids } => {
                inner.last_picture_id = inner.last_picture_id.max(picture.id);
                for t in tag_ids {
                    inner.picture_tags.insert((picture.id, t));
                    inner.tag_pictures.insert((t, picture.id));
                }
                inner.pictures.insert(picture.id, picture);
            }
            RecBody::SetDescription {
                picture_id,
                description,
            } => {
                if let Some(p) = inner.pictures.get_mut(&picture_id) {
                    p.description = description;
                }
            }
            RecBody::DeletePicture { picture_id } => {
                inner.purge_picture(picture_id);
            }
            RecBody::PutRating { rating } => {
                inner.last_rating_id = inner.last_rating_id.max(rating.id);
                inner
                    .ratings
                    .insert((rating.picture_id, rating.user_id), rating);
            }
            RecBody::DeleteRating {
                picture_id,
                user_id,
            } => {
                inner.ratings.remove(&(picture_id, user_id));
            }
        }
    }

    // Current state as full-row records, in a deterministic order, plus the
    // sequence the export is valid at. Feeding the records back through
    // apply_record rebuilds this store.
    pub fn export_with_seq(&self) -> (u64, Vec<RecBody>) {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        out.extend(users.into_iter().map(|user| RecBody::PutUser { user }));
        let mut tags: Vec<Tag> = inner.tags.values().cloned().collect();
        tags.sort_by_key(|t| t.id);
        out.extend(tags.into_iter().map(|tag| RecBody::PutTag { tag }));
        let mut pictures: Vec<Picture> = inner.pictures.values().cloned().collect();
        pictures.sort_by_key(|p| p.id);
        for picture in pictures {
            let tag_ids = inner.tag_ids_for(picture.id);
            out.push(RecBody::PutPicture { picture, tag_ids });
        }
        out.extend(
            inner
                .ratings
                .values()
                .cloned()
                .map(|rating| RecBody::PutRating { rating }),
        );
        (inner.seq, out)
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.read().seq
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStore {
    async fn create_user(&self, req: NewUser) -> Result<User> {
        Ok(self.insert_user(req)?.0)
    }

    async fn get_user(&self, id: UserId) -> Result<User> {
        self.inner
            .read()
            .users
            .get(&id)
            .cloned()
            .ok_or(StoreError::UserNotFound)
    }

    async fn count_users(&self) -> Result<usize> {
        Ok(self.inner.read().users.len())
    }

    async fn search_users(&self, q: UserSearch, sort: UserSort, page: Page) -> Result<Vec<User>> {
        let _timer = SEARCH_SECONDS.with_label_values(&["users"]).start_timer();
        let inner = self.inner.read();
        let keyword = q.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty());
        let mut out: Vec<User> = inner
            .users
            .values()
            .filter(|u| match keyword {
                Some(k) => contains_ci(&u.username, k) || contains_ci(&u.email, k),
                None => true,
            })
            .cloned()
            .collect();
        drop(inner);
        sort_users(&mut out, sort);
        Ok(page.apply(out))
    }

    async fn create_picture(&self, owner: UserId, req: NewPicture) -> Result<PictureWithMeta> {
        Ok(self.insert_picture(owner, req)?.0)
    }

    async fn get_picture(&self, id: PictureId) -> Result<PictureWithMeta> {
        let inner = self.inner.read();
        let picture = inner.pictures.get(&id).ok_or(StoreError::PictureNotFound)?;
        Ok(inner.with_meta(picture))
    }

    async fn list_pictures(&self, page: Page) -> Result<Vec<PictureWithMeta>> {
        let inner = self.inner.read();
        let mut pictures: Vec<Picture> = inner.pictures.values().cloned().collect();
        pictures.sort_by_key(|p| p.id);
        Ok(page
            .apply(pictures)
            .iter()
            .map(|p| inner.with_meta(p))
            .collect())
    }

    async fn delete_picture(&self, id: PictureId) -> Result<()> {
        self.remove_picture(id)?;
        Ok(())
    }

    async fn set_description(&self, id: PictureId, description: Option<String>) -> Result<Picture> {
        Ok(self.update_description(id, description)?.0)
    }

    async fn search_pictures(
        &self,
        q: PictureSearch,
        sort: PictureSort,
        page: Page,
    ) -> Result<Vec<PictureWithMeta>> {
        let _timer = SEARCH_SECONDS.with_label_values(&["pictures"]).start_timer();
        let inner = self.inner.read();
        // resolve tag-driven candidate sets up front
        let keyword = q.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty());
        let keyword_tagged = keyword.map(|k| inner.pictures_tagged_like(k));
        let tag_patterns: Vec<&str> = q
            .tags
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        let tag_filter = if tag_patterns.is_empty() {
            None
        } else {
            let mut set = HashSet::new();
            for p in &tag_patterns {
                set.extend(inner.pictures_tagged_like(p));
            }
            Some(set)
        };
        let mut out = Vec::new();
        for picture in inner.pictures.values() {
            if let Some(k) = keyword {
                let in_desc = picture
                    .description
                    .as_deref()
                    .map(|d| contains_ci(d, k))
                    .unwrap_or(false);
                let in_tags = keyword_tagged
                    .as_ref()
                    .map(|s| s.contains(&picture.id))
                    .unwrap_or(false);
                if !in_desc && !in_tags {
                    continue;
                }
            }
            if let Some(set) = &tag_filter {
                if !set.contains(&picture.id) {
                    continue;
                }
            }
            if let Some(t) = q.added_after {
                if picture.created_at < t {
                    continue;
                }
            }
            let meta = inner.with_meta(picture);
            if let Some(min) = q.min_rating {
                // unrated pictures carry no average and never pass a floor
                match meta.average_rating {
                    Some(avg) if avg >= min => {}
                    _ => continue,
                }
            }
            out.push(meta);
        }
        drop(inner);
        sort_pictures(&mut out, sort);
        Ok(page.apply(out))
    }

    async fn users_by_picture(&self, f: UsersByPictureFilter) -> Result<Vec<UserPictureCount>> {
        let inner = self.inner.read();
        let mut counts: BTreeMap<UserId, usize> = BTreeMap::new();
        for picture in inner.pictures.values() {
            if let Some(uid) = f.user_id {
                if picture.user_id != uid {
                    continue;
                }
            }
            if let Some(t) = f.added_after {
                if picture.created_at < t {
                    continue;
                }
            }
            if let Some(min) = f.min_rating {
                match inner.average_for(picture.id) {
                    Some(avg) if avg >= min => {}
                    _ => continue,
                }
            }
            *counts.entry(picture.user_id).or_default() += 1;
        }
        let mut out = Vec::with_capacity(counts.len());
        for (uid, picture_count) in counts {
            if let Some(user) = inner.users.get(&uid) {
                out.push(UserPictureCount {
                    user: user.clone(),
                    picture_count,
                });
            }
        }
        Ok(out)
    }

    async fn upsert_rating(
        &self,
        picture_id: PictureId,
        user_id: UserId,
        value: RatingValue,
    ) -> Result<Rating> {
        Ok(self.put_rating(picture_id, user_id, value)?.0)
    }

    async fn delete_rating(&self, picture_id: PictureId, user_id: UserId) -> Result<bool> {
        Ok(self.remove_rating(picture_id, user_id)?.0)
    }

    async fn picture_ratings(&self, picture_id: PictureId) -> Result<BTreeMap<UserId, u8>> {
        let inner = self.inner.read();
        if !inner.pictures.contains_key(&picture_id) {
            return Err(StoreError::PictureNotFound);
        }
        Ok(inner
            .ratings
            .range((picture_id, UserId::MIN)..=(picture_id, UserId::MAX))
            .map(|(&(_, uid), r)| (uid, r.value.get()))
            .collect())
    }

    async fn average_rating(&self, picture_id: PictureId) -> Result<Option<f64>> {
        let inner = self.inner.read();
        if !inner.pictures.contains_key(&picture_id) {
            return Err(StoreError::PictureNotFound);
        }
        Ok(inner.average_for(picture_id))
    }
}

fn cmp_opt_avg(a: Option<f64>, b: Option<f64>) -> Ordering {
    // a missing average sorts below every real one
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn apply_order(ord: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Asc => ord,
        SortOrder::Desc => ord.reverse(),
    }
}

// Explicit field-to-comparator mapping; ties always break by ascending id
// so result order is deterministic in both directions.
fn sort_pictures(items: &mut [PictureWithMeta], sort: PictureSort) {
    items.sort_by(|a, b| {
        let ord = match sort.field {
            PictureSortField::Rating => cmp_opt_avg(a.average_rating, b.average_rating),
            PictureSortField::CreatedAt => a.picture.created_at.cmp(&b.picture.created_at),
        };
        apply_order(ord, sort.order).then_with(|| a.picture.id.cmp(&b.picture.id))
    });
}

fn sort_users(items: &mut [User], sort: UserSort) {
    items.sort_by(|a, b| {
        let ord = match sort.field {
            UserSortField::Username => a.username.cmp(&b.username),
            UserSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        };
        apply_order(ord, sort.order).then_with(|| a.id.cmp(&b.id))
    });
}
