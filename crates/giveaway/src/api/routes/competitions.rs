use axum::{
    extract::{Path, State},
    response::ErrorResponse,
    Json,
};
use log::error;
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    api::extractors::AuthedUser,
    domain::{Competition, CreateCompetition, Ticket, TicketSource},
    startup::AppState,
};

// Admin surface; upstream gateway restricts who can reach it
pub async fn create_competition(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateCompetition>,
) -> Result<Json<Competition>, ErrorResponse> {
    state
        .competition_store
        .create_competition(body)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error creating competition: {:?}", e);
            e.into()
        })
}

pub async fn get_competitions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Competition>>, ErrorResponse> {
    state
        .competition_store
        .get_competitions()
        .await
        .map(Json)
        .map_err(|e| {
            error!("error listing competitions: {:?}", e);
            e.into()
        })
}

pub async fn get_competition(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<Competition>, ErrorResponse> {
    state
        .competition_store
        .get_competition(&slug)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error getting competition {}: {:?}", slug, e);
            e.into()
        })
}

pub async fn get_user_tickets(
    AuthedUser { user_id }: AuthedUser,
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<Vec<Ticket>>, ErrorResponse> {
    state
        .competition_store
        .get_user_tickets(&slug, &user_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error getting tickets for {}: {:?}", slug, e);
            e.into()
        })
}

/// Issue tickets outside the payment flow (admin grants, gifts, earned
/// rewards). Purchases are rejected here; they settle through payments.
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub owner_id: String,
    pub quantity: u32,
    pub source: TicketSource,
}

pub async fn grant_tickets(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<GrantRequest>,
) -> Result<Json<Ticket>, ErrorResponse> {
    state
        .competition_store
        .issue_ticket(&slug, &body.owner_id, body.quantity, body.source)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error granting tickets in {}: {:?}", slug, e);
            e.into()
        })
}
