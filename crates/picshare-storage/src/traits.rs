use picshare_core::{
    NewPicture, NewUser, Page, Picture, PictureId, PictureSearch, PictureSort, PictureWithMeta,
    Rating, RatingValue, Result, StoreError, User, UserId, UserPictureCount, UserSearch, UserSort,
    UsersByPictureFilter,
};
use std::collections::BTreeMap;

#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {
    // Users
    async fn create_user(&self, req: NewUser) -> Result<User>;
    async fn get_user(&self, id: UserId) -> Result<User>;
    async fn count_users(&self) -> Result<usize>;
    async fn search_users(&self, q: UserSearch, sort: UserSort, page: Page) -> Result<Vec<User>>;

    // Pictures
    async fn create_picture(&self, owner: UserId, req: NewPicture) -> Result<PictureWithMeta>;
    async fn get_picture(&self, id: PictureId) -> Result<PictureWithMeta>;
    async fn list_pictures(&self, page: Page) -> Result<Vec<PictureWithMeta>>;
    async fn delete_picture(&self, id: PictureId) -> Result<()>;
    // `None` clears the description.
    async fn set_description(&self, id: PictureId, description: Option<String>) -> Result<Picture>;
    async fn search_pictures(
        &self,
        q: PictureSearch,
        sort: PictureSort,
        page: Page,
    ) -> Result<Vec<PictureWithMeta>>;
    async fn users_by_picture(&self, f: UsersByPictureFilter) -> Result<Vec<UserPictureCount>>;

    // Ratings. One row per (picture, rater); writes are upserts.
    async fn upsert_rating(
        &self,
        picture_id: PictureId,
        user_id: UserId,
        value: RatingValue,
    ) -> Result<Rating>;
    // Returns whether a rating was actually removed.
    async fn delete_rating(&self, picture_id: PictureId, user_id: UserId) -> Result<bool>;
    async fn picture_ratings(&self, picture_id: PictureId) -> Result<BTreeMap<UserId, u8>>;
    async fn average_rating(&self, picture_id: PictureId) -> Result<Option<f64>>;

    // Admin; only meaningful for journal-backed stores.
    async fn admin_snapshot(&self) -> Result<(String, u64)> {
        Err(StoreError::Invalid("not persistent".into()))
    }
    async fn admin_manifest(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({"mode": "memory"}))
    }
    async fn admin_trim_journal(&self, _snapshot_id: &str) -> Result<Vec<String>> {
        Err(StoreError::Invalid("not persistent".into()))
    }
}
