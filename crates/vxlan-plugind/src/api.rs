//! Docker remote network-driver protocol.
//!
//! Every call is a POST with a JSON body. The daemon does not send a JSON
//! content type, so bodies are decoded from raw bytes.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::IpAddr;
use tracing::{debug, warn};
use vxlan_common::{DriverError, IpamEntry};
use vxlan_types::{EndpointId, NetworkId};

use crate::driver::Driver;
use crate::options::flatten_options;

/// Content type of every plugin response.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

/// Prefix the daemon gives the interface inside the container.
pub const CONTAINER_IFACE_PREFIX: &str = "eth";

pub fn router(driver: Driver) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .route("/NetworkDriver.DiscoverNew", post(no_op))
        .route("/NetworkDriver.DiscoverDelete", post(no_op))
        .route("/NetworkDriver.ProgramExternalConnectivity", post(no_op))
        .route("/NetworkDriver.RevokeExternalConnectivity", post(no_op))
        .with_state(driver)
}

/// A JSON body with the plugin content type.
struct Reply(Value);

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)],
            self.0.to_string(),
        )
            .into_response()
    }
}

/// Answers `{"Err": ...}` with status 500.
#[derive(Debug)]
struct ApiError(String);

impl From<DriverError> for ApiError {
    fn from(e: DriverError) -> Self {
        Self(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "Plugin request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)],
            json!({ "Err": self.0 }).to_string(),
        )
            .into_response()
    }
}

type ApiResult = Result<Reply, ApiError>;

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError(format!("malformed request: {}", e)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpamData {
    #[serde(default)]
    pool: String,
    #[serde(default)]
    gateway: String,
}

#[derive(Debug, Deserialize)]
struct CreateNetworkRequest {
    #[serde(rename = "NetworkID")]
    network_id: String,
    #[serde(rename = "Options", default)]
    options: Value,
    #[serde(rename = "IPv4Data", default)]
    ipv4_data: Option<Vec<IpamData>>,
    #[serde(rename = "IPv6Data", default)]
    ipv6_data: Option<Vec<IpamData>>,
}

#[derive(Debug, Deserialize)]
struct NetworkRequest {
    #[serde(rename = "NetworkID")]
    network_id: String,
}

#[derive(Debug, Deserialize)]
struct EndpointRequest {
    #[serde(rename = "NetworkID")]
    network_id: String,
    #[serde(rename = "EndpointID")]
    endpoint_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct InterfaceName {
    src_name: String,
    dst_prefix: String,
}

#[derive(Debug, Serialize)]
struct JoinResponse {
    #[serde(rename = "InterfaceName")]
    interface_name: InterfaceName,
    #[serde(rename = "Gateway", skip_serializing_if = "String::is_empty")]
    gateway: String,
    #[serde(rename = "GatewayIPv6", skip_serializing_if = "String::is_empty")]
    gateway_ipv6: String,
}

async fn activate() -> Reply {
    Reply(json!({ "Implements": ["NetworkDriver"] }))
}

async fn capabilities(State(driver): State<Driver>) -> Reply {
    let scope = driver.capabilities().as_str();
    Reply(json!({ "Scope": scope, "ConnectivityScope": scope }))
}

async fn create_network(State(driver): State<Driver>, body: Bytes) -> ApiResult {
    let req: CreateNetworkRequest = decode(&body)?;
    let mut ipam = Vec::new();
    for data in req
        .ipv4_data
        .iter()
        .flatten()
        .chain(req.ipv6_data.iter().flatten())
    {
        if let Some(entry) = IpamEntry::from_parts(&data.pool, &data.gateway)? {
            ipam.push(entry);
        }
    }

    let id = NetworkId::new(req.network_id);
    driver
        .create_network(&id, flatten_options(&req.options), ipam)
        .await?;
    Ok(Reply(json!({})))
}

async fn delete_network(State(driver): State<Driver>, body: Bytes) -> ApiResult {
    let req: NetworkRequest = decode(&body)?;
    driver.delete_network(&NetworkId::new(req.network_id)).await?;
    Ok(Reply(json!({})))
}

async fn create_endpoint(State(driver): State<Driver>, body: Bytes) -> ApiResult {
    let req: EndpointRequest = decode(&body)?;
    driver
        .create_endpoint(
            &NetworkId::new(req.network_id),
            &EndpointId::new(req.endpoint_id),
        )
        .await?;
    Ok(Reply(json!({})))
}

async fn delete_endpoint(State(driver): State<Driver>, body: Bytes) -> ApiResult {
    let req: EndpointRequest = decode(&body)?;
    driver
        .delete_endpoint(
            &NetworkId::new(req.network_id),
            &EndpointId::new(req.endpoint_id),
        )
        .await?;
    Ok(Reply(json!({})))
}

async fn endpoint_info(State(driver): State<Driver>, body: Bytes) -> ApiResult {
    let req: EndpointRequest = decode(&body)?;
    let value = driver.endpoint_info(
        &NetworkId::new(req.network_id),
        &EndpointId::new(req.endpoint_id),
    );
    Ok(Reply(json!({ "Value": value })))
}

async fn join(State(driver): State<Driver>, body: Bytes) -> ApiResult {
    let req: EndpointRequest = decode(&body)?;
    let info = driver
        .join(
            &NetworkId::new(req.network_id),
            &EndpointId::new(req.endpoint_id),
        )
        .await?;

    let (gateway, gateway_ipv6) = match info.gateway {
        Some(IpAddr::V4(gw)) => (gw.to_string(), String::new()),
        Some(IpAddr::V6(gw)) => (String::new(), gw.to_string()),
        None => (String::new(), String::new()),
    };
    let response = JoinResponse {
        interface_name: InterfaceName {
            src_name: info.interface_name,
            dst_prefix: CONTAINER_IFACE_PREFIX.to_string(),
        },
        gateway,
        gateway_ipv6,
    };
    let value = serde_json::to_value(response).map_err(|e| ApiError(e.to_string()))?;
    Ok(Reply(value))
}

async fn leave(State(driver): State<Driver>, body: Bytes) -> ApiResult {
    let req: EndpointRequest = decode(&body)?;
    driver
        .leave(
            &NetworkId::new(req.network_id),
            &EndpointId::new(req.endpoint_id),
        )
        .await?;
    Ok(Reply(json!({})))
}

async fn no_op(body: Bytes) -> Reply {
    debug!(bytes = body.len(), "Ignoring no-op plugin call");
    Reply(json!({}))
}
