use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::server::auth::AuthUser;
use crate::server::convert_errors;
use crate::server::responses::{ApiError, Health};
use crate::state::State as AppState;
use crate::storage::entities::{Feed, FeedFollow, Post, User};

const DEFAULT_POST_COUNT: u32 = 10;
const MAX_POST_COUNT: u32 = 100;

type Result<T, E = ApiError> = std::result::Result<T, E>;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PostsQuery {
    limit: Option<u32>,
}

impl PostsQuery {
    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_POST_COUNT).min(MAX_POST_COUNT)
    }
}

pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

pub async fn error() -> ApiError {
    ApiError::Internal
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreateUser {
    name: String,
}

pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUser>, JsonRejection>,
) -> Result<(StatusCode, Json<User>)> {
    let Json(req) = payload?;
    let name = req.name.trim();

    if name.is_empty() {
        return Err(ApiError::BadRequest("the name must not be empty".into()));
    }

    let user = convert_errors(async {
        let mut tx = state.storage.begin().await?;
        let user = tx.create_user(name).await?;
        tx.commit().await?;

        Ok(user)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_current_user(AuthUser(user): AuthUser) -> Json<User> {
    Json(user)
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreateFeed {
    name: String,
    url: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct CreatedFeed {
    feed: Feed,
    feed_follow: FeedFollow,
}

pub async fn create_feed(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    payload: Result<Json<CreateFeed>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedFeed>)> {
    let Json(req) = payload?;
    let name = req.name.trim();

    if name.is_empty() {
        return Err(ApiError::BadRequest("the name must not be empty".into()));
    }

    let url = Url::parse(req.url.trim())
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .ok_or_else(|| ApiError::BadRequest(format!("`{}` is not an HTTP(S) URL", req.url)))?;

    let created = convert_errors(async {
        let mut tx = state.storage.begin().await?;
        let Some(feed) = tx.create_feed(user.id, name, &url).await? else {
            return Ok(None);
        };
        let feed_follow = tx.create_feed_follow(user.id, feed.id).await?;
        tx.commit().await?;

        Ok(feed_follow.map(|feed_follow| CreatedFeed { feed, feed_follow }))
    })
    .await?;

    created
        .map(|created| (StatusCode::CREATED, Json(created)))
        .ok_or_else(|| ApiError::Conflict(format!("a feed for `{url}` already exists")))
}

pub async fn get_feeds(State(state): State<AppState>) -> Result<Json<Vec<Feed>>> {
    let feeds = convert_errors(async {
        let mut tx = state.storage.begin().await?;
        let feeds = tx.get_feeds().await?;
        tx.commit().await?;

        Ok(feeds)
    })
    .await?;

    Ok(Json(feeds))
}

pub async fn get_feed_posts(
    State(state): State<AppState>,
    feed_id: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<PostsQuery>, QueryRejection>,
) -> Result<Json<Vec<Post>>> {
    let Path(feed_id) = feed_id?;
    let Query(query) = query?;

    let posts = convert_errors(async {
        let mut tx = state.storage.begin().await?;

        if tx.get_feed(feed_id).await?.is_none() {
            return Ok(None);
        }

        let posts = tx.get_feed_posts(feed_id, query.limit()).await?;
        tx.commit().await?;

        Ok(Some(posts))
    })
    .await?;

    posts
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no feed with id {feed_id}")))
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreateFeedFollow {
    feed_id: Uuid,
}

pub async fn create_feed_follow(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    payload: Result<Json<CreateFeedFollow>, JsonRejection>,
) -> Result<(StatusCode, Json<FeedFollow>)> {
    let Json(req) = payload?;

    let follow = convert_errors(async {
        let mut tx = state.storage.begin().await?;

        if let Some(follow) = tx.create_feed_follow(user.id, req.feed_id).await? {
            tx.commit().await?;

            return Ok(Ok(follow));
        }

        if tx.get_feed(req.feed_id).await?.is_none() {
            return Ok(Err(ApiError::NotFound(format!(
                "no feed with id {}",
                req.feed_id
            ))));
        }

        Ok(Err(ApiError::Conflict("the feed is already followed".into())))
    })
    .await??;

    Ok((StatusCode::CREATED, Json(follow)))
}

pub async fn get_feed_follows(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<FeedFollow>>> {
    let follows = convert_errors(async {
        let mut tx = state.storage.begin().await?;
        let follows = tx.get_feed_follows(user.id).await?;
        tx.commit().await?;

        Ok(follows)
    })
    .await?;

    Ok(Json(follows))
}

pub async fn delete_feed_follow(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    follow_id: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode> {
    let Path(follow_id) = follow_id?;

    let deleted = convert_errors(async {
        let mut tx = state.storage.begin().await?;
        let deleted = tx.delete_feed_follow(user.id, follow_id).await?;
        tx.commit().await?;

        Ok(deleted)
    })
    .await?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no feed follow with id {follow_id}")))
    }
}

pub async fn get_posts(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    query: Result<Query<PostsQuery>, QueryRejection>,
) -> Result<Json<Vec<Post>>> {
    let Query(query) = query?;

    let posts = convert_errors(async {
        let mut tx = state.storage.begin().await?;
        let posts = tx.get_user_posts(user.id, query.limit()).await?;
        tx.commit().await?;

        Ok(posts)
    })
    .await?;

    Ok(Json(posts))
}
