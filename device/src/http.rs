use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::watch};
use tracing::info;

use thermolink_common::{
    commands::{CMD_SET_PROGRAM, STATUS_BAD_REQUEST},
    CommandReply, ManualSetpointPayload, RemoteCommand, Temperature,
};

use crate::{control::ControlHandle, dispatch::CommandDispatcher, uplink::transport::CommandHandler};

const MAX_OVERRIDE_HOURS: u32 = 24 * 365;

#[derive(Clone)]
pub struct HttpState {
    pub dispatcher: CommandDispatcher,
    pub handle: ControlHandle,
}

/// Facade-shaped request for a temporary setpoint. `hours` is a presentation
/// convenience; the core only ever sees an absolute expiry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SetpointRequest {
    setpoint: Temperature,
    #[serde(default)]
    hours: Option<u32>,
    #[serde(default)]
    until_epoch: Option<i64>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/read", get(handle_read))
        .route("/api/setpoint/add", post(handle_setpoint_add))
        .route("/api/setpoint/clear", post(handle_setpoint_clear))
        .route("/api/away/on", post(handle_away_on))
        .route("/api/away/off", post(handle_away_off))
        .route("/api/program", get(handle_get_program).post(handle_set_program))
        .with_state(state)
}

pub async fn serve(
    port: u16,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind command server at {addr}"))?;

    info!("command server listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn handle_read(State(state): State<HttpState>) -> Response {
    envelope(state.dispatcher.dispatch(&RemoteCommand::ReadNow).await)
}

async fn handle_setpoint_add(State(state): State<HttpState>, body: Bytes) -> Response {
    let request: SetpointRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(STATUS_BAD_REQUEST, &format!("invalid request: {err}")),
    };

    let until_epoch = match (request.hours, request.until_epoch) {
        (Some(_), Some(_)) => {
            return error_response(STATUS_BAD_REQUEST, "give either 'hours' or 'untilEpoch', not both");
        }
        (Some(hours), None) => {
            if !(1..=MAX_OVERRIDE_HOURS).contains(&hours) {
                return error_response(STATUS_BAD_REQUEST, "'hours' is out of range");
            }
            Some(state.handle.epoch_now() + i64::from(hours) * 3_600)
        }
        (None, until_epoch) => until_epoch,
    };

    let command = RemoteCommand::SetManualSetpoint(ManualSetpointPayload {
        setpoint: request.setpoint,
        until_epoch,
    });
    envelope(state.dispatcher.dispatch(&command).await)
}

async fn handle_setpoint_clear(State(state): State<HttpState>) -> Response {
    envelope(state.dispatcher.dispatch(&RemoteCommand::ClearManualSetpoint).await)
}

async fn handle_away_on(State(state): State<HttpState>) -> Response {
    envelope(state.dispatcher.dispatch(&RemoteCommand::SetAwayOn).await)
}

async fn handle_away_off(State(state): State<HttpState>) -> Response {
    envelope(state.dispatcher.dispatch(&RemoteCommand::SetAwayOff).await)
}

async fn handle_get_program(State(state): State<HttpState>) -> Response {
    envelope(state.dispatcher.dispatch(&RemoteCommand::GetProgram).await)
}

async fn handle_set_program(State(state): State<HttpState>, body: Bytes) -> Response {
    envelope(state.dispatcher.handle(CMD_SET_PROGRAM, &body).await)
}

/// The reply travels as `{status, payload}` with the same HTTP status.
fn envelope(reply: CommandReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply)).into_response()
}

fn error_response(status: u16, message: &str) -> Response {
    envelope(CommandReply::error(status, message))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use thermolink_common::{Configuration, Schedule};

    use super::*;
    use crate::{control::SystemClock, store::ConfigStore};

    fn state(dir: &tempfile::TempDir) -> HttpState {
        let config = Configuration {
            schedule: Schedule::uniform(Temperature::from_degrees(19)),
            ..Configuration::default()
        };
        let handle = ControlHandle::new(config, ConfigStore::new(dir.path()), Arc::new(SystemClock));
        HttpState {
            dispatcher: CommandDispatcher::new(handle.clone()),
            handle,
        }
    }

    async fn body_of(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn read_wraps_telemetry_in_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = body_of(handle_read(State(state(&dir))).await).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!(200));
        assert_eq!(body["payload"]["currentSetpoint"], json!(19.0));
    }

    #[tokio::test]
    async fn hours_become_an_absolute_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let before = Utc::now().timestamp();

        let body = Bytes::from_static(br#"{"setpoint": 22, "hours": 2}"#);
        let (status, body) = body_of(handle_setpoint_add(State(state.clone()), body).await).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payload"]["currentSetpoint"], json!(22.0));
        let until = state.handle.config().await.override_until.unwrap();
        assert!(until >= before + 7_200 && until <= Utc::now().timestamp() + 7_200);
    }

    #[tokio::test]
    async fn explicit_expiry_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let until = Utc::now().timestamp() + 600;

        let body = Bytes::from(format!(r#"{{"setpoint": 21.5, "untilEpoch": {until}}}"#));
        let (status, body) = body_of(handle_setpoint_add(State(state.clone()), body).await).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payload"]["overrideEndEpoch"], json!(until));
    }

    #[tokio::test]
    async fn bad_setpoint_requests_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        for raw in [
            r#"{"setpoint": 22, "hours": 0}"#,
            r#"{"setpoint": 22, "hours": 1, "untilEpoch": 99999999999}"#,
            r#"{"temperature": 22}"#,
            "not json",
        ] {
            let response = handle_setpoint_add(State(state.clone()), Bytes::from(raw)).await;
            let (status, body) = body_of(response).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{raw}");
            assert_eq!(body["status"], json!(400));
            assert!(body["payload"]["error"].is_string());
        }
        assert_eq!(state.handle.config().await.override_setpoint, None);
    }

    #[tokio::test]
    async fn away_and_clear_routes_reach_the_dispatcher() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let (_, body) = body_of(handle_away_on(State(state.clone())).await).await;
        assert_eq!(body["payload"]["currentSetpoint"], json!(12.0));

        let (_, body) = body_of(handle_away_off(State(state.clone())).await).await;
        assert_eq!(body["payload"]["currentSetpoint"], json!(19.0));

        handle_away_on(State(state.clone())).await;
        let (_, body) = body_of(handle_setpoint_clear(State(state.clone())).await).await;
        assert_eq!(body["payload"]["overrideEndEpoch"], json!(null));
    }

    #[tokio::test]
    async fn program_routes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let replacement = Schedule::uniform(Temperature::from_degrees(21));
        let raw = serde_json::to_vec(&replacement).unwrap();
        let (status, _) = body_of(handle_set_program(State(state.clone()), Bytes::from(raw)).await).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = body_of(handle_get_program(State(state.clone())).await).await;
        assert_eq!(body["payload"]["3"]["12"]["0"], json!(21.0));
    }
}
