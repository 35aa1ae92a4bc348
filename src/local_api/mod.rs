use crate::{app_state::AppState, error::DownloadError, model::AddToQueueRequest};
use axum::{
  extract::{Path, State},
  http::{HeaderMap, StatusCode},
  response::{sse::Event, IntoResponse, Response, Sse},
  routing::{delete, get, post},
  Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::{convert::Infallible, future::Future, net::SocketAddr, time::Duration};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};

pub fn router(state: AppState) -> Router {
  let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

  Router::new()
    .route("/queue", get(get_queue).post(post_queue))
    .route("/queue/finished", delete(delete_finished))
    .route("/queue/:id", delete(delete_item))
    .route("/queue/:id/download", post(post_download_item))
    .route("/download-all", post(post_download_all))
    .route("/quick-download", post(post_quick_download))
    .route("/cancel", post(post_cancel))
    .route("/events", get(get_events))
    .layer(cors)
    .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
  let listener = tokio::net::TcpListener::bind(addr).await?;
  tracing::info!(addr = %listener.local_addr()?, "starting local api");
  axum::serve(listener, router(state)).await?;
  Ok(())
}

fn check_auth(headers: &HeaderMap, token: Option<&str>) -> bool {
  let Some(token) = token else {
    return true;
  };
  if let Some(v) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
    if let Some(rest) = v.strip_prefix("Bearer ") {
      return rest.trim() == token;
    }
  }
  if let Some(v) = headers.get("x-firedown-token").and_then(|v| v.to_str().ok()) {
    return v.trim() == token;
  }
  false
}

fn error_response(err: &DownloadError) -> Response {
  let status = if !err.is_rejection() {
    StatusCode::BAD_GATEWAY
  } else {
    match err {
      DownloadError::Validation(_) => StatusCode::BAD_REQUEST,
      DownloadError::UnknownItem(_) => StatusCode::NOT_FOUND,
      _ => StatusCode::CONFLICT,
    }
  };
  (status, Json(json!({ "error": err.to_string(), "code": err.code() }))).into_response()
}

/// Runs a long command in the background; its outcome reaches clients through `/events`.
fn spawn_command<F, T>(st: &AppState, what: &'static str, fut: F)
where
  F: Future<Output = Result<T, DownloadError>> + Send + 'static,
  T: Send + 'static,
{
  let events = st.events.clone();
  tokio::spawn(async move {
    if let Err(e) = fut.await {
      tracing::warn!(command = what, error = %e, "command rejected");
      events.emit_error(e.to_string());
    }
  });
}

async fn get_queue(State(st): State<AppState>, headers: HeaderMap) -> Response {
  if !check_auth(&headers, st.token.as_deref()) {
    return StatusCode::UNAUTHORIZED.into_response();
  }
  Json(st.engine.snapshot()).into_response()
}

async fn post_queue(
  State(st): State<AppState>,
  headers: HeaderMap,
  Json(req): Json<AddToQueueRequest>,
) -> Response {
  if !check_auth(&headers, st.token.as_deref()) {
    return StatusCode::UNAUTHORIZED.into_response();
  }
  match st.engine.add_to_queue(&req.url, req.options).await {
    Ok(items) => (StatusCode::CREATED, Json(items)).into_response(),
    Err(e) => error_response(&e),
  }
}

async fn delete_item(State(st): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
  if !check_auth(&headers, st.token.as_deref()) {
    return StatusCode::UNAUTHORIZED.into_response();
  }
  match st.engine.remove_from_queue(&id) {
    Ok(_) => StatusCode::NO_CONTENT.into_response(),
    Err(e) => error_response(&e),
  }
}

async fn delete_finished(State(st): State<AppState>, headers: HeaderMap) -> Response {
  if !check_auth(&headers, st.token.as_deref()) {
    return StatusCode::UNAUTHORIZED.into_response();
  }
  let removed = st.engine.clear_finished();
  Json(json!({ "removed": removed })).into_response()
}

async fn post_download_item(State(st): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
  if !check_auth(&headers, st.token.as_deref()) {
    return StatusCode::UNAUTHORIZED.into_response();
  }
  let engine = st.engine.clone();
  spawn_command(&st, "download_single", async move { engine.download_single(&id).await });
  StatusCode::ACCEPTED.into_response()
}

async fn post_download_all(State(st): State<AppState>, headers: HeaderMap) -> Response {
  if !check_auth(&headers, st.token.as_deref()) {
    return StatusCode::UNAUTHORIZED.into_response();
  }
  let engine = st.engine.clone();
  spawn_command(&st, "download_all", async move { engine.download_all().await });
  StatusCode::ACCEPTED.into_response()
}

async fn post_quick_download(
  State(st): State<AppState>,
  headers: HeaderMap,
  Json(req): Json<AddToQueueRequest>,
) -> Response {
  if !check_auth(&headers, st.token.as_deref()) {
    return StatusCode::UNAUTHORIZED.into_response();
  }
  let engine = st.engine.clone();
  spawn_command(&st, "quick_download", async move {
    engine.quick_download(&req.url, req.options).await
  });
  StatusCode::ACCEPTED.into_response()
}

async fn post_cancel(State(st): State<AppState>, headers: HeaderMap) -> Response {
  if !check_auth(&headers, st.token.as_deref()) {
    return StatusCode::UNAUTHORIZED.into_response();
  }
  let cancelled = st.engine.cancel();
  (StatusCode::ACCEPTED, Json(json!({ "cancelled": cancelled }))).into_response()
}

async fn get_events(State(st): State<AppState>, headers: HeaderMap) -> Response {
  if !check_auth(&headers, st.token.as_deref()) {
    return StatusCode::UNAUTHORIZED.into_response();
  }

  // Each client gets a broadcast receiver; events are serialized as JSON.
  let rx = st.events.subscribe();
  let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
    match msg {
      Ok(evt) => {
        let json = serde_json::to_string(&evt).unwrap_or_else(|_| "{\"type\":\"Error\"}".to_string());
        Some(Ok::<Event, Infallible>(Event::default().data(json)))
      }
      // A lagging client skips ahead; the next snapshot is complete on its own.
      Err(_) => None,
    }
  });

  sse(stream).into_response()
}

fn sse<S>(stream: S) -> Sse<S>
where
  S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
  Sse::new(stream).keep_alive(
    axum::response::sse::KeepAlive::new()
      .interval(Duration::from_secs(15))
      .text("keep-alive"),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::http::HeaderValue;

  #[test]
  fn open_when_no_token_is_configured() {
    assert!(check_auth(&HeaderMap::new(), None));
  }

  #[test]
  fn accepts_bearer_or_custom_header() {
    let mut bearer = HeaderMap::new();
    bearer.insert("authorization", HeaderValue::from_static("Bearer s3cret"));
    assert!(check_auth(&bearer, Some("s3cret")));

    let mut custom = HeaderMap::new();
    custom.insert("x-firedown-token", HeaderValue::from_static(" s3cret "));
    assert!(check_auth(&custom, Some("s3cret")));

    let mut wrong = HeaderMap::new();
    wrong.insert("authorization", HeaderValue::from_static("Bearer nope"));
    assert!(!check_auth(&wrong, Some("s3cret")));
    assert!(!check_auth(&HeaderMap::new(), Some("s3cret")));
  }

  #[test]
  fn busy_and_in_progress_map_to_conflict() {
    let resp = error_response(&DownloadError::ItemInProgress("x".into()));
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let resp = error_response(&DownloadError::Busy("download"));
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let resp = error_response(&DownloadError::Validation("bad".into()));
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let resp = error_response(&DownloadError::JobExpired);
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
  }
}
