use crate::model::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Conjunctive picture filters; absent fields impose no restriction.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PictureSearch {
    pub keyword: Option<String>,
    pub tags: Option<Vec<String>>,
    pub min_rating: Option<f64>,
    pub added_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserSearch {
    // Matches username or email, case-insensitive substring.
    pub keyword: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsersByPictureFilter {
    pub user_id: Option<UserId>,
    pub min_rating: Option<f64>,
    pub added_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PictureSortField {
    Rating,
    #[default]
    CreatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserSortField {
    Username,
    #[default]
    CreatedAt,
}

// Sort parameters come in as free-form strings; anything outside the
// allow-list silently falls back to the default instead of erroring.
impl SortOrder {
    pub fn parse_or_default(s: Option<&str>) -> Self {
        match s.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("asc") => Self::Asc,
            Some(v) if v.eq_ignore_ascii_case("desc") => Self::Desc,
            _ => Self::default(),
        }
    }
}

impl PictureSortField {
    pub fn parse_or_default(s: Option<&str>) -> Self {
        match s.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("rating") => Self::Rating,
            Some(v) if v.eq_ignore_ascii_case("created_at") => Self::CreatedAt,
            _ => Self::default(),
        }
    }
}

impl UserSortField {
    pub fn parse_or_default(s: Option<&str>) -> Self {
        match s.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("username") => Self::Username,
            Some(v) if v.eq_ignore_ascii_case("created_at") => Self::CreatedAt,
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PictureSort {
    pub field: PictureSortField,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct UserSort {
    pub field: UserSortField,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    pub skip: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { skip: 0, limit: 100 }
    }
}

impl Page {
    pub fn new(skip: Option<usize>, limit: Option<usize>) -> Self {
        let d = Self::default();
        Self {
            skip: skip.unwrap_or(d.skip),
            limit: limit.unwrap_or(d.limit),
        }
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.skip).take(self.limit).collect()
    }
}
