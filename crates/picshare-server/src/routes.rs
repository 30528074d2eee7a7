use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use picshare_core::{
    NewPicture, NewUser, Page, PictureSearch, PictureSort, PictureSortField, RatingValue,
    SortOrder, User, UserId, UserSearch, UserSort, UserSortField, UsersByPictureFilter,
};
use picshare_storage::Storage;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{authenticate, require_admin, require_moderator};
use crate::error::ApiError;
use crate::metrics;
use crate::schemas::{DescriptionResponse, PictureResponse, UserPictureCountResponse, UserResponse};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/api/search/pictures", get(search_pictures))
        .route("/api/search/users", get(search_users))
        .route("/api/search/users/by_picture", get(users_by_picture))
        .route("/api/pictures", get(list_pictures).post(create_picture))
        .route("/api/pictures/:id", get(get_picture).delete(delete_picture))
        .route(
            "/api/pictures/:id/description",
            get(get_description)
                .put(put_description)
                .delete(delete_description),
        )
        .route("/api/descriptions", get(list_descriptions))
        .route("/api/ratings", post(rate_picture))
        .route(
            "/api/ratings/:picture_id",
            get(rating_breakdown).delete(delete_rating),
        )
        .route("/api/ratings/:picture_id/average", get(rating_average))
        .route("/api/users", post(register_user))
        .route("/admin/snapshot", post(admin_snapshot))
        .route("/admin/manifest", get(admin_manifest))
        .route("/admin/trim-journal", post(admin_trim_journal))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_text() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    let _ = encoder.encode(&prometheus::gather(), &mut buf);
    (StatusCode::OK, String::from_utf8(buf).unwrap_or_default())
}

// Absent and empty both mean "no restriction"; a present but unparseable
// timestamp is the caller's mistake and gets a 400.
fn parse_added_after(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| ApiError::BadRequest("invalid added_after timestamp".into())),
    }
}

// ---------- search ----------

#[derive(Debug, Default, Deserialize)]
pub struct PictureSearchParams {
    pub keyword: Option<String>,
    // comma-separated tag name patterns
    pub tags: Option<String>,
    pub min_rating: Option<f64>,
    pub added_after: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl PictureSearchParams {
    fn into_query(self) -> Result<(PictureSearch, PictureSort, Page), ApiError> {
        let added_after = parse_added_after(self.added_after.as_deref())?;
        let tags = self.tags.map(|raw| {
            raw.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        });
        let q = PictureSearch {
            keyword: self.keyword,
            tags,
            min_rating: self.min_rating,
            added_after,
        };
        let sort = PictureSort {
            field: PictureSortField::parse_or_default(self.sort_by.as_deref()),
            order: SortOrder::parse_or_default(self.sort_order.as_deref()),
        };
        Ok((q, sort, Page::new(self.skip, self.limit)))
    }
}

async fn search_pictures(
    State(app): State<AppState>,
    Query(params): Query<PictureSearchParams>,
) -> Result<Json<Vec<PictureResponse>>, ApiError> {
    let _timer = metrics::observe_op("search_pictures");
    let (q, sort, page) = params.into_query()?;
    let hits = app.store.search_pictures(q, sort, page).await?;
    Ok(Json(hits.into_iter().map(PictureResponse::from).collect()))
}

#[derive(Debug, Default, Deserialize)]
pub struct UserSearchParams {
    pub keyword: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

async fn search_users(
    State(app): State<AppState>,
    Query(params): Query<UserSearchParams>,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    let _timer = metrics::observe_op("search_users");
    let q = UserSearch {
        keyword: params.keyword,
    };
    let sort = UserSort {
        field: UserSortField::parse_or_default(params.sort_by.as_deref()),
        order: SortOrder::parse_or_default(params.sort_order.as_deref()),
    };
    let page = Page::new(params.skip, params.limit);
    let hits = app.store.search_users(q, sort, page).await?;
    Ok(Json(hits.into_iter().map(UserResponse::from).collect()))
}

#[derive(Debug, Default, Deserialize)]
pub struct UsersByPictureParams {
    pub user_id: Option<UserId>,
    pub min_rating: Option<f64>,
    pub added_after: Option<String>,
}

async fn users_by_picture(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UsersByPictureParams>,
) -> Result<Json<Vec<UserPictureCountResponse>>, ApiError> {
    let caller = authenticate(&app, &headers).await?;
    require_moderator(&caller)?;
    let _timer = metrics::observe_op("users_by_picture");
    let filter = UsersByPictureFilter {
        user_id: params.user_id,
        min_rating: params.min_rating,
        added_after: parse_added_after(params.added_after.as_deref())?,
    };
    let rows = app.store.users_by_picture(filter).await?;
    Ok(Json(
        rows.into_iter().map(UserPictureCountResponse::from).collect(),
    ))
}

// ---------- pictures ----------

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

async fn list_pictures(
    State(app): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<PictureResponse>>, ApiError> {
    let _timer = metrics::observe_op("list_pictures");
    let pics = app
        .store
        .list_pictures(Page::new(params.skip, params.limit))
        .await?;
    Ok(Json(pics.into_iter().map(PictureResponse::from).collect()))
}

async fn get_picture(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<PictureResponse>, ApiError> {
    let _timer = metrics::observe_op("get_picture");
    let meta = app.store.get_picture(id).await?;
    Ok(Json(meta.into()))
}

async fn create_picture(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NewPicture>,
) -> Result<(StatusCode, Json<PictureResponse>), ApiError> {
    let caller = authenticate(&app, &headers).await?;
    let _timer = metrics::observe_op("create_picture");
    let meta = app.store.create_picture(caller.id, req).await?;
    Ok((StatusCode::CREATED, Json(meta.into())))
}

fn ensure_owner_or_admin(caller: &User, owner: UserId) -> Result<(), ApiError> {
    if caller.id == owner || caller.is_admin {
        Ok(())
    } else {
        Err(ApiError::Forbidden("not the picture owner".into()))
    }
}

async fn delete_picture(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let caller = authenticate(&app, &headers).await?;
    let _timer = metrics::observe_op("delete_picture");
    let meta = app.store.get_picture(id).await?;
    ensure_owner_or_admin(&caller, meta.picture.user_id)?;
    app.store.delete_picture(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------- descriptions ----------

async fn get_description(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DescriptionResponse>, ApiError> {
    let _timer = metrics::observe_op("get_description");
    let meta = app.store.get_picture(id).await?;
    Ok(Json(DescriptionResponse::from(&meta.picture)))
}

async fn list_descriptions(
    State(app): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<DescriptionResponse>>, ApiError> {
    let _timer = metrics::observe_op("list_descriptions");
    let pics = app
        .store
        .list_pictures(Page::new(params.skip, params.limit))
        .await?;
    Ok(Json(
        pics.iter().map(|m| DescriptionResponse::from(&m.picture)).collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DescriptionUpdate {
    pub description: String,
}

async fn put_description(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<DescriptionUpdate>,
) -> Result<Json<DescriptionResponse>, ApiError> {
    let caller = authenticate(&app, &headers).await?;
    let _timer = metrics::observe_op("put_description");
    let meta = app.store.get_picture(id).await?;
    ensure_owner_or_admin(&caller, meta.picture.user_id)?;
    let updated = app
        .store
        .set_description(id, Some(body.description))
        .await?;
    Ok(Json(DescriptionResponse::from(&updated)))
}

async fn delete_description(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<DescriptionResponse>, ApiError> {
    let caller = authenticate(&app, &headers).await?;
    let _timer = metrics::observe_op("delete_description");
    let meta = app.store.get_picture(id).await?;
    ensure_owner_or_admin(&caller, meta.picture.user_id)?;
    let cleared = app.store.set_description(id, None).await?;
    Ok(Json(DescriptionResponse::from(&cleared)))
}

// ---------- ratings ----------

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub picture_id: i64,
    pub value: u8,
}

async fn rate_picture(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RateRequest>,
) -> Result<Json<Value>, ApiError> {
    let caller = authenticate(&app, &headers).await?;
    let _timer = metrics::observe_op("rate_picture");
    let value = RatingValue::new(req.value)?;
    app.store
        .upsert_rating(req.picture_id, caller.id, value)
        .await?;
    Ok(Json(json!({"message": "rating created or updated"})))
}

async fn delete_rating(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(picture_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let caller = authenticate(&app, &headers).await?;
    let _timer = metrics::observe_op("delete_rating");
    let removed = app.store.delete_rating(picture_id, caller.id).await?;
    let message = if removed {
        "rating removed successfully"
    } else {
        "no rating found"
    };
    Ok(Json(json!({"message": message})))
}

async fn rating_breakdown(
    State(app): State<AppState>,
    Path(picture_id): Path<i64>,
) -> Result<Json<BTreeMap<UserId, u8>>, ApiError> {
    let _timer = metrics::observe_op("rating_breakdown");
    let breakdown = app.store.picture_ratings(picture_id).await?;
    Ok(Json(breakdown))
}

async fn rating_average(
    State(app): State<AppState>,
    Path(picture_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let _timer = metrics::observe_op("rating_average");
    match app.store.average_rating(picture_id).await? {
        Some(average) => Ok(Json(json!({"picture_id": picture_id, "average": average}))),
        None => Ok(Json(
            json!({"picture_id": picture_id, "message": "no ratings available"}),
        )),
    }
}

// ---------- users ----------

#[derive(Debug, Deserialize)]
pub struct RegisterUser {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub is_moderator: bool,
    #[serde(default)]
    pub is_admin: bool,
}

// Role flags on registration need an admin caller, except when the store is
// empty: the first account bootstraps itself. The store re-checks emptiness
// under its write lock, so racing first registrations cannot both claim roles.
async fn register_user(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterUser>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let _timer = metrics::observe_op("register_user");
    let wants_roles = req.is_moderator || req.is_admin;
    let bootstrap = wants_roles && app.store.count_users().await? == 0;
    if wants_roles && !bootstrap {
        let caller = authenticate(&app, &headers).await?;
        require_admin(&caller)?;
    }
    let user = app
        .store
        .create_user(NewUser {
            username: req.username,
            email: req.email,
            is_moderator: req.is_moderator,
            is_admin: req.is_admin,
            bootstrap,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

// ---------- admin ----------

async fn admin_snapshot(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let caller = authenticate(&app, &headers).await?;
    require_admin(&caller)?;
    let t0 = std::time::Instant::now();
    match app.store.admin_snapshot().await {
        Ok((snapshot_id, last_seq)) => {
            metrics::SNAPSHOT_TOTAL.with_label_values(&["ok"]).inc();
            metrics::SNAPSHOT_DURATION_SECONDS.observe(t0.elapsed().as_secs_f64());
            Ok(Json(
                json!({"snapshot_id": snapshot_id, "last_seq": last_seq}),
            ))
        }
        Err(e) => {
            metrics::SNAPSHOT_TOTAL.with_label_values(&["error"]).inc();
            metrics::SNAPSHOT_DURATION_SECONDS.observe(t0.elapsed().as_secs_f64());
            Err(e.into())
        }
    }
}

async fn admin_manifest(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let caller = authenticate(&app, &headers).await?;
    require_admin(&caller)?;
    let manifest = app.store.admin_manifest().await?;
    Ok(Json(manifest))
}

#[derive(Debug, Default, Deserialize)]
pub struct TrimParams {
    pub snapshot_id: Option<String>,
}

async fn admin_trim_journal(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TrimParams>,
) -> Result<Json<Value>, ApiError> {
    let caller = authenticate(&app, &headers).await?;
    require_admin(&caller)?;
    let snapshot_id = params.snapshot_id.unwrap_or_default();
    if snapshot_id.is_empty() {
        return Err(ApiError::BadRequest("missing snapshot_id".into()));
    }
    let deleted = app.store.admin_trim_journal(&snapshot_id).await?;
    Ok(Json(json!({"deleted": deleted})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{mint_token, AuthKeys, Claims};
    use picshare_core::User;
    use picshare_storage::{InMemoryStore, Storage};
    use std::sync::Arc;

    const SECRET: &str = "route-test-secret";

    fn app() -> AppState {
        AppState {
            store: Arc::new(InMemoryStore::new()),
            auth: AuthKeys::single("active", SECRET),
        }
    }

    async fn register(app: &AppState, name: &str, moderator: bool, admin: bool) -> User {
        app.store
            .create_user(NewUser {
                username: name.to_string(),
                email: format!("{name}@example.com"),
                is_moderator: moderator,
                is_admin: admin,
                bootstrap: false,
            })
            .await
            .unwrap()
    }

    fn bearer_for(user: &User) -> HeaderMap {
        let claims = Claims {
            sub: user.id,
            exp: chrono::Utc::now().timestamp() + 600,
            jti: Some(ulid::Ulid::new().to_string()),
        };
        let token = mint_token("active", SECRET, &claims).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    async fn seed_picture(app: &AppState, owner: &User, description: &str) -> PictureResponse {
        app.store
            .create_picture(
                owner.id,
                NewPicture {
                    description: Some(description.to_string()),
                    picture_url: "https://img.example/p.png".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .into()
    }

    // ===== search =====

    #[tokio::test]
    async fn empty_search_is_ok_not_an_error() {
        let app = app();
        let Json(hits) = search_pictures(State(app), Query(PictureSearchParams::default()))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn malformed_added_after_is_a_bad_request() {
        let app = app();
        let params = PictureSearchParams {
            added_after: Some("yesterday".into()),
            ..Default::default()
        };
        let err = search_pictures(State(app), Query(params)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn well_formed_added_after_filters() {
        let app = app();
        let alice = register(&app, "alice", false, false).await;
        seed_picture(&app, &alice, "old pier").await;
        let params = PictureSearchParams {
            added_after: Some((Utc::now() + chrono::Duration::hours(1)).to_rfc3339()),
            ..Default::default()
        };
        let Json(hits) = search_pictures(State(app), Query(params)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn unknown_sort_params_fall_back_to_defaults() {
        let app = app();
        let alice = register(&app, "alice", false, false).await;
        let first = seed_picture(&app, &alice, "first").await;
        let second = seed_picture(&app, &alice, "second").await;

        let params = PictureSearchParams {
            sort_by: Some("popularity".into()),
            sort_order: Some("sideways".into()),
            ..Default::default()
        };
        let Json(hits) = search_pictures(State(app), Query(params)).await.unwrap();
        // default created_at desc puts the newer picture first
        let ids: Vec<_> = hits.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn by_picture_is_gated_on_moderator_role() {
        let app = app();
        let plain = register(&app, "plain", false, false).await;
        let moderator = register(&app, "mod", true, false).await;
        seed_picture(&app, &plain, "mine").await;

        let err = users_by_picture(
            State(app.clone()),
            bearer_for(&plain),
            Query(UsersByPictureParams::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let Json(rows) = users_by_picture(
            State(app),
            bearer_for(&moderator),
            Query(UsersByPictureParams::default()),
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].username, "plain");
        assert_eq!(rows[0].picture_count, 1);
    }

    // ===== pictures and descriptions =====

    #[tokio::test]
    async fn create_picture_owner_is_the_caller() {
        let app = app();
        let alice = register(&app, "alice", false, false).await;
        let (status, Json(resp)) = create_picture(
            State(app),
            bearer_for(&alice),
            Json(NewPicture {
                picture_url: "https://img.example/a.png".into(),
                tags: vec!["sunset".into()],
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(resp.user_id, alice.id);
        assert_eq!(resp.tags.len(), 1);
        assert!(resp.average_rating.is_none());
    }

    #[tokio::test]
    async fn picture_lookup_misses_are_not_found() {
        let app = app();
        let err = get_picture(State(app), Path(424242)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn description_updates_respect_ownership() {
        let app = app();
        let alice = register(&app, "alice", false, false).await;
        let bob = register(&app, "bob", false, false).await;
        let admin = register(&app, "root", false, true).await;
        let pic = seed_picture(&app, &alice, "draft").await;

        let err = put_description(
            State(app.clone()),
            bearer_for(&bob),
            Path(pic.id),
            Json(DescriptionUpdate {
                description: "hijacked".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let Json(updated) = put_description(
            State(app.clone()),
            bearer_for(&alice),
            Path(pic.id),
            Json(DescriptionUpdate {
                description: "golden hour".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.description.as_deref(), Some("golden hour"));

        // admins may clear anyone's description
        let Json(cleared) = delete_description(State(app), bearer_for(&admin), Path(pic.id))
            .await
            .unwrap();
        assert!(cleared.description.is_none());
    }

    #[tokio::test]
    async fn deleting_someone_elses_picture_is_forbidden() {
        let app = app();
        let alice = register(&app, "alice", false, false).await;
        let bob = register(&app, "bob", false, false).await;
        let pic = seed_picture(&app, &alice, "keep out").await;

        let err = delete_picture(State(app.clone()), bearer_for(&bob), Path(pic.id))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let status = delete_picture(State(app), bearer_for(&alice), Path(pic.id))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    // ===== ratings =====

    #[tokio::test]
    async fn rating_lifecycle_messages() {
        let app = app();
        let alice = register(&app, "alice", false, false).await;
        let pic = seed_picture(&app, &alice, "rate me").await;

        let Json(posted) = rate_picture(
            State(app.clone()),
            bearer_for(&alice),
            Json(RateRequest {
                picture_id: pic.id,
                value: 4,
            }),
        )
        .await
        .unwrap();
        assert_eq!(posted["message"], "rating created or updated");

        // second post overwrites, same message
        let Json(again) = rate_picture(
            State(app.clone()),
            bearer_for(&alice),
            Json(RateRequest {
                picture_id: pic.id,
                value: 2,
            }),
        )
        .await
        .unwrap();
        assert_eq!(again["message"], "rating created or updated");

        let Json(breakdown) = rating_breakdown(State(app.clone()), Path(pic.id))
            .await
            .unwrap();
        assert_eq!(breakdown.get(&alice.id), Some(&2));

        let Json(removed) = delete_rating(State(app.clone()), bearer_for(&alice), Path(pic.id))
            .await
            .unwrap();
        assert_eq!(removed["message"], "rating removed successfully");

        let Json(missing) = delete_rating(State(app), bearer_for(&alice), Path(pic.id))
            .await
            .unwrap();
        assert_eq!(missing["message"], "no rating found");
    }

    #[tokio::test]
    async fn out_of_scale_rating_is_a_bad_request() {
        let app = app();
        let alice = register(&app, "alice", false, false).await;
        let pic = seed_picture(&app, &alice, "strict scale").await;

        let err = rate_picture(
            State(app),
            bearer_for(&alice),
            Json(RateRequest {
                picture_id: pic.id,
                value: 9,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rating_without_a_token_is_unauthorized() {
        let app = app();
        let alice = register(&app, "alice", false, false).await;
        let pic = seed_picture(&app, &alice, "members only").await;

        let err = rate_picture(
            State(app),
            HeaderMap::new(),
            Json(RateRequest {
                picture_id: pic.id,
                value: 3,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn average_reports_mean_or_absence() {
        let app = app();
        let alice = register(&app, "alice", false, false).await;
        let bob = register(&app, "bob", false, false).await;
        let pic = seed_picture(&app, &alice, "averaged").await;

        let Json(empty) = rating_average(State(app.clone()), Path(pic.id)).await.unwrap();
        assert_eq!(empty["message"], "no ratings available");

        for (user, value) in [(&alice, 5), (&bob, 2)] {
            rate_picture(
                State(app.clone()),
                bearer_for(user),
                Json(RateRequest {
                    picture_id: pic.id,
                    value,
                }),
            )
            .await
            .unwrap();
        }
        let Json(avg) = rating_average(State(app.clone()), Path(pic.id)).await.unwrap();
        assert_eq!(avg["average"], 3.5);

        let err = rating_average(State(app), Path(999)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    // ===== users =====

    #[tokio::test]
    async fn bootstrap_admin_then_role_grants_need_admin() {
        let app = app();

        // empty store: the first account may claim roles without a token
        let (status, Json(first)) = register_user(
            State(app.clone()),
            HeaderMap::new(),
            Json(RegisterUser {
                username: "root".into(),
                email: "root@example.com".into(),
                is_moderator: false,
                is_admin: true,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        // now role requests without a token are rejected
        let err = register_user(
            State(app.clone()),
            HeaderMap::new(),
            Json(RegisterUser {
                username: "sneaky".into(),
                email: "sneaky@example.com".into(),
                is_moderator: true,
                is_admin: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        // plain accounts still register freely
        let (_, Json(plain)) = register_user(
            State(app.clone()),
            HeaderMap::new(),
            Json(RegisterUser {
                username: "alice".into(),
                email: "alice@example.com".into(),
                is_moderator: false,
                is_admin: false,
            }),
        )
        .await
        .unwrap();
        let alice = app.store.get_user(plain.id).await.unwrap();

        let err = register_user(
            State(app.clone()),
            bearer_for(&alice),
            Json(RegisterUser {
                username: "wannabe".into(),
                email: "wannabe@example.com".into(),
                is_moderator: true,
                is_admin: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let root = app.store.get_user(first.id).await.unwrap();
        let (_, Json(granted)) = register_user(
            State(app.clone()),
            bearer_for(&root),
            Json(RegisterUser {
                username: "mod".into(),
                email: "mod@example.com".into(),
                is_moderator: true,
                is_admin: false,
            }),
        )
        .await
        .unwrap();
        assert!(app.store.get_user(granted.id).await.unwrap().is_moderator);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let app = app();
        register(&app, "alice", false, false).await;
        let err = register_user(
            State(app),
            HeaderMap::new(),
            Json(RegisterUser {
                username: "ALICE".into(),
                email: "alice2@example.com".into(),
                is_moderator: false,
                is_admin: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    // ===== admin =====

    #[tokio::test]
    async fn admin_routes_gate_on_role_and_store_kind() {
        let app = app();
        let plain = register(&app, "plain", false, false).await;
        let admin = register(&app, "root", false, true).await;

        let err = admin_snapshot(State(app.clone()), bearer_for(&plain))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        // memory store has no journal to snapshot
        let err = admin_snapshot(State(app.clone()), bearer_for(&admin))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let Json(manifest) = admin_manifest(State(app.clone()), bearer_for(&admin))
            .await
            .unwrap();
        assert_eq!(manifest["mode"], "memory");

        let err = admin_trim_journal(
            State(app),
            bearer_for(&admin),
            Query(TrimParams { snapshot_id: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn snapshot_duration_is_recorded_on_failure() {
        let app = app();
        let admin = register(&app, "root", false, true).await;

        // memory store has no journal, so the snapshot attempt fails
        let before = metrics::SNAPSHOT_DURATION_SECONDS.get_sample_count();
        let _ = admin_snapshot(State(app), bearer_for(&admin))
            .await
            .unwrap_err();
        let after = metrics::SNAPSHOT_DURATION_SECONDS.get_sample_count();
        assert!(after > before);
    }
}
