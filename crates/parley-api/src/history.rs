use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use parley_db::models::group_reactions;
use parley_types::api::Claims;
use parley_types::models::MessagePayload;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass the smallest message id from the
    /// previous page to fetch older messages.
    pub before_id: Option<i64>,
}

fn default_limit() -> u32 {
    50
}

/// History fetch for (re)joining clients: the gateway does not replay
/// backlog, so missed messages are read here. Serves the same enriched
/// shape the gateway broadcasts, newest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    // Run all blocking DB queries off the async runtime
    let db = state.db.clone();
    let cid = chat_id.to_string();
    let uid = claims.sub.to_string();
    let limit = query.limit.min(200);
    let before_id = query.before_id;

    let (rows, reaction_rows) = tokio::task::spawn_blocking(move || {
        if !db
            .is_active_participant(&cid, &uid)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        {
            return Err(StatusCode::FORBIDDEN);
        }

        let rows = db
            .get_messages(&cid, limit, before_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        let message_ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let reaction_rows = db
            .get_reactions_for_messages(&message_ids)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        Ok::<_, StatusCode>((rows, reaction_rows))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })??;

    let mut grouped = group_reactions(&reaction_rows);
    let messages: Vec<MessagePayload> = rows
        .into_iter()
        .map(|row| {
            let reactions = grouped.remove(&row.id).unwrap_or_default();
            row.into_payload(reactions)
        })
        .collect();

    Ok(Json(messages))
}
