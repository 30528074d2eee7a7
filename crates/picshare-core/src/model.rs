use crate::errors::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type PictureId = i64;
pub type TagId = i64;
pub type RatingId = i64;

// Validated at construction; a held value is always on the 1..=5 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct RatingValue(u8);

impl RatingValue {
    pub fn new(value: u8) -> crate::errors::Result<Self> {
        Self::try_from(value).map_err(Into::into)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for RatingValue {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (1..=5).contains(&value) {
            Ok(Self(value))
        } else {
            Err(StoreError::Invalid(format!(
                "rating value {value} outside 1..=5"
            )))
        }
    }
}

impl From<RatingValue> for u8 {
    fn from(value: RatingValue) -> u8 {
        value.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub is_moderator: bool,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Picture {
    pub id: PictureId,
    pub user_id: UserId,
    #[serde(default)]
    pub description: Option<String>,
    pub picture_url: String,
    #[serde(default)]
    pub qr_code_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
}

// The (picture_id, user_id) pair is unique; id survives re-rating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rating {
    pub id: RatingId,
    pub picture_id: PictureId,
    pub user_id: UserId,
    pub value: RatingValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub is_moderator: bool,
    #[serde(default)]
    pub is_admin: bool,
    // Role claim backed only by store emptiness, re-checked at insert.
    #[serde(default)]
    pub bootstrap: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewPicture {
    #[serde(default)]
    pub description: Option<String>,
    pub picture_url: String,
    #[serde(default)]
    pub qr_code_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    // Creation-time override for imports; defaults to now.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Picture {
    pub fn new(id: PictureId, user_id: UserId, mut req: NewPicture) -> Self {
        let created_at = req.created_at.take().unwrap_or_else(Utc::now);
        Self {
            id,
            user_id,
            description: req.description,
            picture_url: req.picture_url,
            qr_code_url: req.qr_code_url,
            created_at,
        }
    }
}

// The average is computed from the rating set on every read, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PictureWithMeta {
    pub picture: Picture,
    #[serde(default)]
    pub tags: Vec<TagId>,
    #[serde(default)]
    pub average_rating: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPictureCount {
    pub user: User,
    pub picture_count: usize,
}
