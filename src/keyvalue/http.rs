use async_std::sync::Arc;
use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};

use crate::keyvalue::command::Command;
use crate::keyvalue::error::KeyValueError;
use crate::keyvalue::service::KeyValueService;
use crate::raft::raft_common_proto::Member;

#[derive(Debug, Deserialize, Serialize)]
pub struct SetBody {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct PeerBody {
    pub id: String,
    pub address: String,
}

impl From<&Member> for PeerBody {
    fn from(member: &Member) -> Self {
        PeerBody {
            id: member.id.clone(),
            address: member.address.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusBody {
    pub leader: Option<PeerBody>,
    pub peers: Vec<PeerBody>,
    pub role: String,
    pub term: i64,
}

// Exposes the key-value service as a small REST api.
//
// > curl -X POST localhost:12345/v1/kv -d '{"key":"foo","value":"bar"}' -H 'content-type: application/json'
// > curl localhost:12345/v1/kv/foo
pub struct HttpHandler {
    service: Arc<KeyValueService>,
}

impl HttpHandler {
    pub fn new(service: Arc<KeyValueService>) -> Self {
        HttpHandler { service }
    }

    pub fn routes(&self) -> Router {
        Router::new()
            .route("/v1/kv", post(set))
            .route("/v1/kv/{key}", get(read).delete(delete))
            .route("/v1/cluster", get(status))
            .with_state(self.service.clone())
    }
}

async fn set(
    State(service): State<Arc<KeyValueService>>,
    Json(body): Json<SetBody>,
) -> Result<StatusCode, KeyValueError> {
    service.write(Command::set(body.key, body.value)).await?;
    Ok(StatusCode::OK)
}

async fn read(
    State(service): State<Arc<KeyValueService>>,
    Path(key): Path<String>,
) -> Result<Response, KeyValueError> {
    let value = service.read(key.as_bytes()).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], value).into_response())
}

async fn delete(
    State(service): State<Arc<KeyValueService>>,
    Path(key): Path<String>,
) -> Result<StatusCode, KeyValueError> {
    service.write(Command::delete(key)).await?;
    Ok(StatusCode::OK)
}

async fn status(
    State(service): State<Arc<KeyValueService>>,
) -> Result<Json<StatusBody>, KeyValueError> {
    let status = service.status().await?;
    Ok(Json(StatusBody {
        leader: status.leader.as_ref().map(PeerBody::from),
        peers: status.members.iter().map(PeerBody::from).collect(),
        role: status.role.to_string(),
        term: status.term,
    }))
}
