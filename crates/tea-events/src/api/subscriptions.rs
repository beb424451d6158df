//! Subscription REST handlers.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::owner::Caller;
use super::AppState;
use crate::domain::{
    ApiError, ApiResult, DeliveryRecord, NewSubscription, Subscription, SubscriptionId,
    SubscriptionPatch,
};
use crate::service::Page;

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl From<PageQuery> for Page {
    fn from(q: PageQuery) -> Self {
        Page::new(q.limit, q.offset)
    }
}

#[derive(Debug, Serialize)]
pub struct SubscriptionList {
    pub subscriptions: Vec<Subscription>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct DeliveryList {
    pub deliveries: Vec<DeliveryRecord>,
    pub limit: usize,
    pub offset: usize,
}

pub(crate) fn subscription_id(path: Result<Path<Uuid>, PathRejection>) -> ApiResult<SubscriptionId> {
    path.map(|Path(id)| id)
        .map_err(|e| ApiError::invalid_request(format!("invalid subscription id: {}", e.body_text())))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::invalid_request(e.body_text()))
}

fn page(query: Result<Query<PageQuery>, QueryRejection>) -> ApiResult<Page> {
    query
        .map(|Query(q)| q.into())
        .map_err(|e| ApiError::invalid_request(e.body_text()))
}

pub async fn create(
    State(state): State<AppState>,
    Caller(owner): Caller,
    body: Result<Json<NewSubscription>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let request = json_body(body)?;
    let subscription = state.pipeline.create_subscription(owner, request).await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn list(
    State(state): State<AppState>,
    Caller(owner): Caller,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<SubscriptionList>> {
    let page = page(query)?;
    let subscriptions = state.pipeline.list_subscriptions(&owner, page).await?;
    Ok(Json(SubscriptionList {
        subscriptions,
        limit: page.limit,
        offset: page.offset,
    }))
}

pub async fn get_one(
    State(state): State<AppState>,
    Caller(owner): Caller,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<Subscription>> {
    let id = subscription_id(path)?;
    Ok(Json(state.pipeline.get_subscription(&owner, id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    Caller(owner): Caller,
    path: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<SubscriptionPatch>, JsonRejection>,
) -> ApiResult<Json<Subscription>> {
    let id = subscription_id(path)?;
    let patch = json_body(body)?;
    Ok(Json(
        state.pipeline.update_subscription(&owner, id, patch).await?,
    ))
}

pub async fn delete(
    State(state): State<AppState>,
    Caller(owner): Caller,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<StatusCode> {
    let id = subscription_id(path)?;
    state.pipeline.delete_subscription(&owner, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deliveries(
    State(state): State<AppState>,
    Caller(owner): Caller,
    path: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<DeliveryList>> {
    let id = subscription_id(path)?;
    let page = page(query)?;
    let deliveries = state.pipeline.list_deliveries(&owner, id, page).await?;
    Ok(Json(DeliveryList {
        deliveries,
        limit: page.limit,
        offset: page.offset,
    }))
}
