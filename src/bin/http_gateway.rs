//! HTTP gateway: primitive record operations (put/get/exists/touch/delete)
//! and variadic UDF invocation against an Aerospike cluster.
//!
//! Responses carry an `X-Aero-Type` header for non-string values; arrays are
//! encoded as a concatenation of 8-hex-digit length prefixes and element
//! bytes.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use log::info;
use serde::Deserialize;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use aerospike::errors::{Error as AsError, ErrorKind};
use aerospike::{
    Bin, Bins, Client, ClientPolicy, ConsistencyLevel, Key, ReadPolicy, ResultCode, Value,
    WritePolicy,
};

use aredis::store::{record_expiration, write_policy_with};

/// HTTP gateway exposing primitive Aerospike record operations.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP listener to
    #[clap(long, default_value = "127.0.0.1")]
    bind_addr: IpAddr,

    /// Port to listen on
    #[clap(long, default_value_t = 8000)]
    port: u16,

    /// Aerospike server host
    #[clap(long, default_value = "localhost")]
    aero_host: String,

    /// Aerospike server port
    #[clap(long, default_value_t = 3000)]
    aero_port: u16,
}

/// Store handle and default policies, shared by every request.
struct Gateway {
    client: Client,
    read_policy: ReadPolicy,
    write_policy: WritePolicy,
}

impl Gateway {
    /// Run a blocking store call off the async runtime.
    async fn run<T, F>(self: &Arc<Self>, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce(&Gateway) -> Result<T, GatewayError> + Send + 'static,
        T: Send + 'static,
    {
        let gw = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&gw))
            .await
            .map_err(|err| GatewayError(err.to_string()))?
    }
}

/// A failed store or argument operation, reported as a 500.
#[derive(Debug)]
struct GatewayError(String);

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0).into_response()
    }
}

fn as_err(err: AsError) -> GatewayError {
    GatewayError(err.to_string())
}

fn build_key(namespace: &str, set: &str, key: &str) -> Result<Key, GatewayError> {
    Key::new(namespace, set, Value::String(key.to_string())).map_err(as_err)
}

/// Body payloads are stored as text when they are valid UTF-8 and as raw
/// bytes otherwise.
fn body_value(body: &Bytes) -> Value {
    match String::from_utf8(body.to_vec()) {
        Ok(s) => Value::String(s),
        Err(_) => Value::Blob(body.to_vec()),
    }
}

/// `__body__` substitutes the whole request body, `__int__<digits>` decodes
/// an integer, anything else is passed through as a string.
fn extract_param(raw: &str, body: &Bytes) -> Result<Value, GatewayError> {
    if raw == "__body__" {
        return Ok(body_value(body));
    }
    if let Some(digits) = raw.strip_prefix("__int__") {
        let n: i64 = digits
            .parse()
            .map_err(|_| GatewayError(format!("bad integer parameter '{raw}'")))?;
        return Ok(Value::Int(n));
    }
    Ok(Value::String(raw.to_string()))
}

/// Array elements are length-prefixed with 8 hex digits; integers are
/// rendered as their decimal string.
fn encode_array(items: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        let bytes = match item {
            Value::Int(n) => n.to_string().into_bytes(),
            Value::UInt(n) => n.to_string().into_bytes(),
            Value::String(s) => s.clone().into_bytes(),
            Value::Blob(b) => b.clone(),
            other => format!("{other:?}").into_bytes(),
        };
        out.extend_from_slice(format!("{:08x}", bytes.len()).as_bytes());
        out.extend_from_slice(&bytes);
    }
    out
}

/// Shape a store value into a response, tagging non-string kinds with the
/// `X-Aero-Type` header. `code_if_null` is the status for absent values.
fn export(value: Option<Value>, code_if_null: StatusCode) -> Response {
    match value {
        None | Some(Value::Nil) => code_if_null.into_response(),
        Some(Value::Int(n)) => ([("x-aero-type", "int")], n.to_string()).into_response(),
        Some(Value::UInt(n)) => ([("x-aero-type", "int")], n.to_string()).into_response(),
        Some(Value::List(items)) => ([("x-aero-type", "array")], encode_array(&items)).into_response(),
        Some(Value::String(s)) => s.into_response(),
        Some(Value::Blob(b)) => b.into_response(),
        Some(other) => GatewayError(format!("unsupported value {other:?}")).into_response(),
    }
}

#[derive(Deserialize)]
struct PutParams {
    namespace: String,
    set: String,
    key: String,
    bin: String,
    ttl: Option<String>,
}

async fn put_record(
    State(gw): State<Arc<Gateway>>,
    Query(p): Query<PutParams>,
    body: Bytes,
) -> Result<StatusCode, GatewayError> {
    let ttl = match p.ttl.as_deref() {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| GatewayError(format!("bad ttl '{raw}'")))?,
        None => -1,
    };
    gw.run(move |g| {
        let key = build_key(&p.namespace, &p.set, &p.key)?;
        let policy = if ttl == -1 {
            g.write_policy.clone()
        } else {
            write_policy_with(ttl, false)
        };
        let bin = Bin::new(&p.bin, body_value(&body));
        g.client.put(&policy, &key, &[bin]).map_err(as_err)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

#[derive(Deserialize)]
struct GetParams {
    namespace: String,
    set: String,
    key: String,
    bin: String,
}

async fn get_record(
    State(gw): State<Arc<Gateway>>,
    Query(p): Query<GetParams>,
) -> Result<Response, GatewayError> {
    gw.run(move |g| {
        let key = build_key(&p.namespace, &p.set, &p.key)?;
        match g
            .client
            .get(&g.read_policy, &key, Bins::Some(vec![p.bin.clone()]))
        {
            Ok(rec) => Ok(export(rec.bins.get(&p.bin).cloned(), StatusCode::NOT_FOUND)),
            Err(AsError(ErrorKind::ServerError(ResultCode::KeyNotFoundError), _)) => {
                Ok(StatusCode::NOT_FOUND.into_response())
            }
            Err(err) => Err(as_err(err)),
        }
    })
    .await
}

#[derive(Deserialize)]
struct KeyParams {
    namespace: String,
    set: String,
    key: String,
}

async fn exists(
    State(gw): State<Arc<Gateway>>,
    Query(p): Query<KeyParams>,
) -> Result<Response, GatewayError> {
    gw.run(move |g| {
        let key = build_key(&p.namespace, &p.set, &p.key)?;
        match g.client.get(&g.read_policy, &key, Bins::None) {
            Ok(rec) => Ok(record_expiration(&rec).to_string().into_response()),
            Err(AsError(ErrorKind::ServerError(ResultCode::KeyNotFoundError), _)) => {
                Ok(StatusCode::NOT_FOUND.into_response())
            }
            Err(err) => Err(as_err(err)),
        }
    })
    .await
}

#[derive(Deserialize)]
struct TouchParams {
    namespace: String,
    set: String,
    key: String,
    ttl: String,
}

async fn touch(
    State(gw): State<Arc<Gateway>>,
    Query(p): Query<TouchParams>,
) -> Result<StatusCode, GatewayError> {
    let ttl: i64 = p
        .ttl
        .parse()
        .map_err(|_| GatewayError(format!("bad ttl '{}'", p.ttl)))?;
    gw.run(move |g| {
        let key = build_key(&p.namespace, &p.set, &p.key)?;
        match g.client.touch(&write_policy_with(ttl, false), &key) {
            Ok(()) => Ok(StatusCode::NO_CONTENT),
            Err(AsError(ErrorKind::ServerError(ResultCode::KeyNotFoundError), _)) => {
                Ok(StatusCode::NOT_FOUND)
            }
            Err(err) => Err(as_err(err)),
        }
    })
    .await
}

async fn delete_record(
    State(gw): State<Arc<Gateway>>,
    Query(p): Query<KeyParams>,
) -> Result<StatusCode, GatewayError> {
    gw.run(move |g| {
        let key = build_key(&p.namespace, &p.set, &p.key)?;
        let existed = g.client.delete(&g.write_policy, &key).map_err(as_err)?;
        Ok(if existed {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::NOT_FOUND
        })
    })
    .await
}

#[derive(Deserialize)]
struct UdfParams {
    namespace: String,
    set: String,
    key: String,
    package: String,
    function: String,
    p1: Option<String>,
    p2: Option<String>,
    p3: Option<String>,
}

async fn invoke_udf(
    gw: Arc<Gateway>,
    p: UdfParams,
    body: Bytes,
    argc: usize,
) -> Result<Response, GatewayError> {
    gw.run(move |g| {
        let key = build_key(&p.namespace, &p.set, &p.key)?;
        let raw = [&p.p1, &p.p2, &p.p3];
        let mut args = Vec::with_capacity(argc);
        for slot in raw.iter().take(argc) {
            let param = (*slot).clone().unwrap_or_default();
            args.push(extract_param(&param, &body)?);
        }
        let result = g
            .client
            .execute_udf(&g.write_policy, &key, &p.package, &p.function, Some(&args))
            .map_err(as_err)?;
        Ok(export(result, StatusCode::NO_CONTENT))
    })
    .await
}

async fn udf_0(
    State(gw): State<Arc<Gateway>>,
    Query(p): Query<UdfParams>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    invoke_udf(gw, p, body, 0).await
}

async fn udf_1(
    State(gw): State<Arc<Gateway>>,
    Query(p): Query<UdfParams>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    invoke_udf(gw, p, body, 1).await
}

async fn udf_2(
    State(gw): State<Arc<Gateway>>,
    Query(p): Query<UdfParams>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    invoke_udf(gw, p, body, 2).await
}

async fn udf_3(
    State(gw): State<Arc<Gateway>>,
    Query(p): Query<UdfParams>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    invoke_udf(gw, p, body, 3).await
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    let hosts = format!("{}:{}", args.aero_host, args.aero_port);
    let client = Client::new(&ClientPolicy::default(), &hosts)
        .map_err(|err| eyre!("connecting to aerospike at {hosts}: {err}"))?;
    info!("connected to aerospike at {hosts}");

    let mut read_policy = ReadPolicy::default();
    read_policy.consistency_level = ConsistencyLevel::ConsistencyOne;
    let state = Arc::new(Gateway {
        client,
        read_policy,
        write_policy: write_policy_with(-1, false),
    });

    let app = Router::new()
        .route("/put", put(put_record))
        .route("/get", get(get_record))
        .route("/exists", get(exists))
        .route("/touch", post(touch))
        .route("/delete", delete(delete_record))
        .route("/udf_0", post(udf_0))
        .route("/udf_1", post(udf_1))
        .route("/udf_2", post(udf_2))
        .route("/udf_3", post(udf_3))
        .with_state(state);

    let addr = SocketAddr::new(args.bind_addr, args.port);
    info!("listening on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_array_hex_prefixes() {
        let items = vec![Value::String("ab".to_string()), Value::Int(7)];
        assert_eq!(encode_array(&items), b"00000002ab000000017");
    }

    #[test]
    fn test_encode_array_empty() {
        assert!(encode_array(&[]).is_empty());
    }

    #[test]
    fn test_extract_param_kinds() {
        let body = Bytes::from_static(b"payload");
        assert_eq!(
            extract_param("plain", &body).unwrap(),
            Value::String("plain".to_string())
        );
        assert_eq!(
            extract_param("__body__", &body).unwrap(),
            Value::String("payload".to_string())
        );
        assert_eq!(extract_param("__int__42", &body).unwrap(), Value::Int(42));
        assert!(extract_param("__int__x", &body).is_err());
    }
}
