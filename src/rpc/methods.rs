//! RPC Method Implementations
//!
//! Each method corresponds to a JSON-RPC call that external apps can make.

use crate::consensus::{NameHeader, NameTrx, OwnerKey};
use crate::constants::PROTOCOL_VERSION;
use crate::crypto::MiniPow;
use crate::error::NameError;
use crate::storage::{ChainState, NameClaim};
use crate::sync::NameChannel;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Value>,
    pub id: Value,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

/// JSON-RPC Error
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Unknown block or name
pub const NOT_FOUND: i32 = -5;
/// Submission failed validation
pub const REJECTED: i32 = -26;

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
}

/// RPC Handler State
#[derive(Clone)]
pub struct RpcState {
    pub channel: NameChannel,
}

impl RpcState {
    pub fn new(channel: NameChannel) -> Self {
        Self { channel }
    }

    fn chain(&self) -> Arc<RwLock<ChainState>> {
        self.channel.chain()
    }
}

fn read(chain: &RwLock<ChainState>) -> RwLockReadGuard<'_, ChainState> {
    chain.read().unwrap_or_else(|e| e.into_inner())
}

/// Name trx as submitted by clients; the owner is base58
#[derive(Debug, Deserialize)]
struct SubmittedTrx {
    #[serde(default = "default_version")]
    version: u32,
    name: String,
    owner: String,
    #[serde(default)]
    prev_trx: u64,
    timestamp: u64,
    nonce: u64,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

/// Process a JSON-RPC request and return a response
pub async fn handle_request(state: &RpcState, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id;
    let params = request.params;
    match request.method.as_str() {
        "getblockcount" => get_block_count(state, id),
        "getbestblockhash" => get_best_block_hash(state, id),
        "getblockheader" => get_block_header(state, id, params),
        "lookupname" => lookup_name(state, id, params),
        "getpendingnames" => get_pending_names(state, id),
        "getchaininfo" => get_chain_info(state, id),
        "submitnametrx" => submit_name_trx(state, id, params).await,
        "getpeerinfo" => get_peer_info(state, id).await,
        _ => JsonRpcResponse::error(
            id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
        ),
    }
}

/// First positional parameter, or the bare value
fn first_param(params: Option<Value>) -> Option<Value> {
    match params {
        Some(Value::Array(mut arr)) if !arr.is_empty() => Some(arr.swap_remove(0)),
        Some(Value::Array(_)) | Some(Value::Null) | None => None,
        Some(other) => Some(other),
    }
}

fn string_param(params: Option<Value>) -> Option<String> {
    match first_param(params) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

fn header_json(header: &NameHeader, chain: &ChainState) -> Value {
    let id = header.id();
    json!({
        "hash": id.to_hex(),
        "height": header.height,
        "previousblockhash": header.prev.to_hex(),
        "trxroot": header.trx_root.to_string(),
        "time": header.timestamp,
        "nonce": header.nonce,
        "leadingzeros": id.leading_zeros(),
        "bestchain": chain.is_on_best_chain(&id),
        "hasblock": chain.has_block(&id),
    })
}

fn claim_json(claim: &NameClaim) -> Value {
    json!({
        "name": claim.name,
        "owner": claim.owner.to_string(),
        "trx": format!("{:016x}", claim.trx_id),
        "block": claim.block.to_hex(),
        "height": claim.height,
    })
}

fn trx_json(trx: &NameTrx) -> Value {
    json!({
        "id": format!("{:016x}", trx.id()),
        "name": trx.name,
        "owner": trx.owner.to_string(),
        "prev_trx": trx.prev_trx,
        "timestamp": trx.timestamp,
        "nonce": trx.nonce,
    })
}

/// Returns the current block height
fn get_block_count(state: &RpcState, id: Value) -> JsonRpcResponse {
    let chain = state.chain();
    let height = read(&chain).height();
    JsonRpcResponse::success(id, json!(height))
}

fn get_best_block_hash(state: &RpcState, id: Value) -> JsonRpcResponse {
    let chain = state.chain();
    let head = read(&chain).head();
    JsonRpcResponse::success(id, json!(head.to_hex()))
}

/// Returns a header by id
fn get_block_header(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let Some(hex) = string_param(params) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected block id".into());
    };
    let block_id = match MiniPow::from_hex(&hex) {
        Ok(block_id) => block_id,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid block id: {}", e)),
    };

    let chain = state.chain();
    let chain = read(&chain);
    match chain.header(&block_id) {
        Some(header) => JsonRpcResponse::success(id, header_json(header, &chain)),
        None => JsonRpcResponse::error(id, NOT_FOUND, "Block not found".into()),
    }
}

fn lookup_name(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let Some(name) = string_param(params) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected name".into());
    };
    match state.channel.lookup_name(&name) {
        Some(claim) => JsonRpcResponse::success(id, claim_json(&claim)),
        None => JsonRpcResponse::error(id, NOT_FOUND, format!("Name not registered: {}", name)),
    }
}

fn get_pending_names(state: &RpcState, id: Value) -> JsonRpcResponse {
    let chain = state.chain();
    let pending: Vec<Value> = read(&chain).pending_trxs().into_iter().map(trx_json).collect();
    JsonRpcResponse::success(id, Value::Array(pending))
}

fn get_chain_info(state: &RpcState, id: Value) -> JsonRpcResponse {
    let stats = state.channel.stats();
    JsonRpcResponse::success(
        id,
        json!({
            "height": stats.height,
            "bestblockhash": stats.head.to_hex(),
            "chainwork": format!("{:x}", stats.cumulative_work),
            "headers": stats.headers,
            "blocks": stats.blocks,
            "orphans": stats.orphans,
            "pending": stats.pending,
            "names": stats.names,
        }),
    )
}

async fn submit_name_trx(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let submitted: SubmittedTrx = match first_param(params).map(serde_json::from_value) {
        Some(Ok(submitted)) => submitted,
        Some(Err(e)) => return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid trx: {}", e)),
        None => return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected trx".into()),
    };
    let owner: OwnerKey = match submitted.owner.parse() {
        Ok(owner) => owner,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, e),
    };
    let trx = NameTrx {
        version: submitted.version,
        name: submitted.name,
        owner,
        prev_trx: submitted.prev_trx,
        timestamp: submitted.timestamp,
        nonce: submitted.nonce,
    };
    let trx_id = trx.id();

    match state.channel.submit_name(trx).await {
        Ok(accepted) => JsonRpcResponse::success(
            id,
            json!({ "id": format!("{:016x}", trx_id), "accepted": accepted }),
        ),
        Err(e @ NameError::ChannelClosed) | Err(e @ NameError::StorageFailure(_)) => {
            JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string())
        }
        Err(e) => JsonRpcResponse::error(id, REJECTED, format!("{}: {}", e.kind(), e)),
    }
}

async fn get_peer_info(state: &RpcState, id: Value) -> JsonRpcResponse {
    match state.channel.peer_count().await {
        Ok(count) => JsonRpcResponse::success(id, json!({ "connected": count })),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}
