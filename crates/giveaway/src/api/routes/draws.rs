use axum::{
    extract::{Path, State},
    response::ErrorResponse,
    Json,
};
use log::error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;

use crate::{
    api::extractors::AuthedUser,
    domain::{ClaimOutcome, CycleOutcome, DrawCycle, DrawStatus, DrawTicket},
    startup::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RunCycleRequest {
    pub week: String,
}

/// External-scheduler entry point: run the weekly draw. Replays are safe.
pub async fn run_draw_cycle(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RunCycleRequest>,
) -> Result<Json<CycleOutcome>, ErrorResponse> {
    state
        .draw_engine
        .run_cycle(&body.week)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error running draw cycle {}: {:?}", body.week, e);
            e.into()
        })
}

/// Public view of a draw cycle. The claim code is only disclosed to the
/// selected winner while the cycle is pending and the window is open.
#[derive(Debug, Serialize)]
pub struct DrawCycleView {
    pub week: String,
    pub prize_pool_minor: i64,
    pub status: DrawStatus,
    pub drawn: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub draw_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claim_expires_at: Option<OffsetDateTime>,
    pub winner_id: Option<String>,
    pub rollover_from_week: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl DrawCycleView {
    fn for_viewer(cycle: DrawCycle, viewer: &str, now: OffsetDateTime) -> Self {
        let is_winner = cycle.winner_id.as_deref() == Some(viewer);
        let code = (is_winner
            && cycle.status == DrawStatus::Pending
            && cycle.claim_window_open_at(now))
        .then(|| cycle.code.clone());

        DrawCycleView {
            week: cycle.week,
            prize_pool_minor: cycle.prize_pool_minor,
            status: cycle.status,
            drawn: cycle.draw_at.is_some(),
            draw_at: cycle.draw_at,
            claim_expires_at: cycle.claim_expires_at,
            winner_id: cycle.winner_id,
            rollover_from_week: cycle.rollover_from_week,
            code,
        }
    }
}

pub async fn get_draw_cycle(
    AuthedUser { user_id }: AuthedUser,
    State(state): State<Arc<AppState>>,
    Path(week): Path<String>,
) -> Result<Json<DrawCycleView>, ErrorResponse> {
    let cycle = state
        .draw_engine
        .store()
        .get_cycle(&week)
        .await
        .map_err(|e| {
            error!("error getting draw cycle {}: {:?}", week, e);
            ErrorResponse::from(e)
        })?
        .ok_or_else(|| {
            ErrorResponse::from(crate::domain::Error::NotFound(format!(
                "draw for week {}",
                week
            )))
        })?;

    Ok(Json(DrawCycleView::for_viewer(
        cycle,
        &user_id,
        OffsetDateTime::now_utc(),
    )))
}

#[derive(Debug, Deserialize)]
pub struct AddEntriesRequest {
    pub user_id: String,
    pub quantity: u32,
}

/// Award weekly-draw eligibility tickets (earned via platform activity;
/// the awarding rules live upstream).
pub async fn add_draw_entries(
    State(state): State<Arc<AppState>>,
    Path(week): Path<String>,
    Json(body): Json<AddEntriesRequest>,
) -> Result<Json<Vec<DrawTicket>>, ErrorResponse> {
    state
        .draw_engine
        .store()
        .add_entries(&body.user_id, &week, body.quantity)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error adding draw entries for {}: {:?}", week, e);
            e.into()
        })
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub code: String,
}

pub async fn claim_draw(
    AuthedUser { user_id }: AuthedUser,
    State(state): State<Arc<AppState>>,
    Path(week): Path<String>,
    Json(body): Json<ClaimRequest>,
) -> Result<Json<ClaimOutcome>, ErrorResponse> {
    state
        .draw_engine
        .claim(&user_id, &body.code, &week)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error claiming draw {}: {:?}", week, e);
            e.into()
        })
}
