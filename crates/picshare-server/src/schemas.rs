// External payload shapes. Internal-only fields (role flags, association
// rows) stop here and never reach the wire.

use chrono::{DateTime, Utc};
use picshare_core::{Picture, PictureWithMeta, TagId, User, UserPictureCount};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PictureResponse {
    pub id: i64,
    pub user_id: i64,
    pub description: Option<String>,
    pub picture_url: String,
    pub qr_code_url: Option<String>,
    pub average_rating: Option<f64>,
    pub tags: Vec<TagId>,
    pub created_at: DateTime<Utc>,
}

impl From<PictureWithMeta> for PictureResponse {
    fn from(meta: PictureWithMeta) -> Self {
        let PictureWithMeta {
            picture,
            tags,
            average_rating,
        } = meta;
        Self {
            id: picture.id,
            user_id: picture.user_id,
            description: picture.description,
            picture_url: picture.picture_url,
            qr_code_url: picture.qr_code_url,
            average_rating,
            tags,
            created_at: picture.created_at,
        }
    }
}

// Role flags are deliberately absent from the public user payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPictureCountResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub picture_count: usize,
}

impl From<UserPictureCount> for UserPictureCountResponse {
    fn from(row: UserPictureCount) -> Self {
        Self {
            id: row.user.id,
            username: row.user.username,
            email: row.user.email,
            picture_count: row.picture_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptionResponse {
    pub picture_id: i64,
    pub description: Option<String>,
}

impl From<&Picture> for DescriptionResponse {
    fn from(picture: &Picture) -> Self {
        Self {
            picture_id: picture.id,
            description: picture.description.clone(),
        }
    }
}
