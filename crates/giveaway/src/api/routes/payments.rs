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
    domain::{CreatePayment, Payment, SettlementReceipt},
    startup::AppState,
};

pub async fn create_payment(
    AuthedUser { user_id }: AuthedUser,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreatePayment>,
) -> Result<Json<Payment>, ErrorResponse> {
    state
        .settlement
        .create(&user_id, body)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error creating payment: {:?}", e);
            e.into()
        })
}

pub async fn approve_payment(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<String>,
) -> Result<Json<Payment>, ErrorResponse> {
    state
        .settlement
        .approve(&payment_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error approving payment {}: {:?}", payment_id, e);
            e.into()
        })
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub txid: String,
}

pub async fn complete_payment(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<SettlementReceipt>, ErrorResponse> {
    state
        .settlement
        .complete(&payment_id, &body.txid)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error completing payment {}: {:?}", payment_id, e);
            e.into()
        })
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled by caller".to_string()
}

pub async fn cancel_payment(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<Payment>, ErrorResponse> {
    state
        .settlement
        .cancel(&payment_id, &body.reason)
        .await
        .map(Json)
        .map_err(|e| {
            error!("error cancelling payment {}: {:?}", payment_id, e);
            e.into()
        })
}
