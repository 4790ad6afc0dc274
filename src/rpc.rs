//! JSON-RPC request processor shared by the console stream and the
//! pub/sub subscribe topic.
//!
//! Requests look like
//! `{"jsonrpc":"2.0","method":"set","params":{"field":"report_seconds","value":"300"},"id":7}`;
//! values are always passed as strings.

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::clock::{TimeProvider, format_iso};
use crate::settings::{
    self, ConfigPair, ConfigStore, Configuration, FIELDS, FieldValue, SettingsError,
};
use crate::status::Status;

pub const REQUEST_LEN: usize = 256;
pub const RESPONSE_LEN: usize = 640;

pub type Request = heapless::Vec<u8, REQUEST_LEN>;
pub type Response = heapless::String<RESPONSE_LEN>;

type IsoTime = heapless::String<20>;

const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RpcError {
    Parse,
    MethodNotFound,
    InvalidParams,
    Settings(SettingsError),
    ResponseTooLong,
}

impl From<SettingsError> for RpcError {
    fn from(e: SettingsError) -> Self {
        RpcError::Settings(e)
    }
}

impl RpcError {
    fn code(self) -> i32 {
        match self {
            RpcError::Parse => -32700,
            RpcError::MethodNotFound => -32601,
            RpcError::InvalidParams => -32602,
            RpcError::Settings(_) => -32000,
            RpcError::ResponseTooLong => -32603,
        }
    }

    fn message(self) -> &'static str {
        match self {
            RpcError::Parse => "parse error",
            RpcError::MethodNotFound => "method not found",
            RpcError::InvalidParams => "invalid params",
            RpcError::Settings(SettingsError::UnknownField) => "unknown field",
            RpcError::Settings(SettingsError::InvalidValue) => "invalid value",
            RpcError::Settings(SettingsError::TooLong) => "value too long",
            RpcError::Settings(SettingsError::Store(_)) => "configuration store error",
            RpcError::Settings(_) => "configuration error",
            RpcError::ResponseTooLong => "response too long",
        }
    }
}

#[derive(Deserialize)]
struct RawRequest<'a> {
    #[serde(default, borrow, rename = "jsonrpc")]
    _version: Option<&'a str>,
    method: &'a str,
    #[serde(default, borrow)]
    params: Params<'a>,
    #[serde(default)]
    id: Option<u32>,
}

#[derive(Deserialize, Default)]
struct Params<'a> {
    #[serde(default, borrow)]
    field: Option<&'a str>,
    #[serde(default, borrow)]
    value: Option<&'a str>,
}

/// What a request may touch.
pub struct RpcContext<'a> {
    pub settings: &'a mut ConfigPair,
    pub config_store: &'a mut dyn ConfigStore,
    pub status: &'a mut Status,
    /// Current wall-clock second, for the `status` reply.
    pub epoch: Option<u32>,
}

#[derive(Serialize)]
struct ErrorObject {
    code: i32,
    message: &'static str,
}

#[derive(Serialize)]
struct Envelope<'a> {
    jsonrpc: &'static str,
    id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Reply<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Reply<'a> {
    Ok {
        ok: bool,
    },
    Field {
        field: &'a str,
        value: FieldValue<'a>,
    },
    Configuration(AllFields<'a>),
    Status(StatusReply),
}

/// Every scalar field plus the sensor count.
struct AllFields<'a>(&'a Configuration);

impl Serialize for AllFields<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for name in FIELDS {
            if let Ok(value) = self.0.field(name) {
                map.serialize_entry(name, &value)?;
            }
        }
        map.serialize_entry("sensors", &self.0.sensors.len())?;
        map.end()
    }
}

#[derive(Serialize)]
struct StatusReply {
    time: Option<IsoTime>,
    provider: TimeProvider,
    connected: bool,
    socket: bool,
    storage_error: bool,
    saved: u32,
    missing: u32,
    published: u32,
    publish_failures: u32,
}

const OK: Reply<'static> = Reply::Ok { ok: true };

fn get<'a>(configuration: &'a Configuration, field: Option<&'a str>) -> Result<Reply<'a>, RpcError> {
    Ok(match field {
        Some(name) => Reply::Field {
            field: name,
            value: configuration.field(name)?,
        },
        None => Reply::Configuration(AllFields(configuration)),
    })
}

fn status(ctx: &RpcContext<'_>) -> StatusReply {
    let status = &*ctx.status;
    StatusReply {
        time: ctx.epoch.map(format_iso),
        provider: status.time_provider,
        connected: status.is_client_connected,
        socket: status.is_client_udp_socket_open,
        storage_error: status.storage_error,
        saved: status.readings_saved,
        missing: status.readings_missing,
        published: status.records_published,
        publish_failures: status.publish_failures,
    }
}

fn dispatch<'a>(
    request: &RawRequest<'a>,
    ctx: &'a mut RpcContext<'_>,
) -> Result<Reply<'a>, RpcError> {
    match request.method {
        "get" => get(ctx.settings.writable(), request.params.field),
        "set" => {
            let (Some(field), Some(value)) = (request.params.field, request.params.value) else {
                return Err(RpcError::InvalidParams);
            };
            ctx.settings.writable_mut().set_field(field, value)?;
            log_info!("rpc: set {} = {}", field, value);
            Ok(OK)
        }
        "save" => {
            settings::save(ctx.config_store, ctx.settings.writable())?;
            ctx.settings.request_commit();
            Ok(OK)
        }
        "reset" => {
            *ctx.settings.writable_mut() = Configuration::default();
            log_info!("rpc: configuration reset to defaults");
            Ok(OK)
        }
        "storage_recover" => {
            ctx.status.storage_error = false;
            log_info!("rpc: storage error cleared");
            Ok(OK)
        }
        "status" => Ok(Reply::Status(status(ctx))),
        _ => Err(RpcError::MethodNotFound),
    }
}

/// Serializes `envelope` into `out`, replacing what it held.
fn emit(envelope: &Envelope<'_>, out: &mut Response) -> Result<(), RpcError> {
    let mut buf = [0u8; RESPONSE_LEN];
    let len =
        serde_json_core::to_slice(envelope, &mut buf).map_err(|_| RpcError::ResponseTooLong)?;
    let text = core::str::from_utf8(&buf[..len]).map_err(|_| RpcError::ResponseTooLong)?;
    out.clear();
    out.push_str(text).map_err(|()| RpcError::ResponseTooLong)
}

fn emit_error(id: Option<u32>, error: RpcError, out: &mut Response) {
    let envelope = Envelope {
        jsonrpc: JSONRPC_VERSION,
        id,
        result: None,
        error: Some(ErrorObject {
            code: error.code(),
            message: error.message(),
        }),
    };
    if emit(&envelope, out).is_err() {
        out.clear();
    }
}

/// Handles one request and leaves the reply in `out`.
pub fn process(request: &[u8], ctx: &mut RpcContext<'_>, out: &mut Response) {
    out.clear();
    ctx.status.rpc_requests = ctx.status.rpc_requests.wrapping_add(1);

    let request = match serde_json_core::from_slice::<RawRequest<'_>>(request) {
        Ok((request, _)) => request,
        Err(_) => {
            log_warn!("rpc: malformed request");
            emit_error(None, RpcError::Parse, out);
            return;
        }
    };

    let id = request.id;
    let emitted = match dispatch(&request, ctx) {
        Ok(reply) => emit(
            &Envelope {
                jsonrpc: JSONRPC_VERSION,
                id,
                result: Some(reply),
                error: None,
            },
            out,
        ),
        Err(e) => Err(e),
    };
    if let Err(e) = emitted {
        log_warn!("rpc: {} failed: {:?}", request.method, e);
        emit_error(id, e, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemoryConfigStore;

    struct Harness {
        settings: ConfigPair,
        store: MemoryConfigStore,
        status: Status,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                settings: ConfigPair::new(Configuration::default()),
                store: MemoryConfigStore::new(),
                status: Status::new(),
            }
        }

        fn call(&mut self, request: &str) -> Response {
            let mut ctx = RpcContext {
                settings: &mut self.settings,
                config_store: &mut self.store,
                status: &mut self.status,
                epoch: Some(1_792_154_096),
            };
            let mut out = Response::new();
            process(request.as_bytes(), &mut ctx, &mut out);
            out
        }
    }

    #[test]
    fn get_single_field() {
        let mut h = Harness::new();
        let out = h.call(
            r#"{"jsonrpc":"2.0","method":"get","params":{"field":"mqtt_port"},"id":1}"#,
        );
        assert_eq!(
            out.as_str(),
            r#"{"jsonrpc":"2.0","id":1,"result":{"field":"mqtt_port","value":1883}}"#
        );
    }

    #[test]
    fn get_everything() {
        let mut h = Harness::new();
        let out = h.call(r#"{"method":"get","id":2}"#);
        assert!(out.starts_with(r#"{"jsonrpc":"2.0","id":2,"result":{"module_name":"#));
        assert!(out.ends_with(r#""sensors":2}}"#));
    }

    #[test]
    fn set_then_save_requests_commit() {
        let mut h = Harness::new();
        let out = h.call(
            r#"{"method":"set","params":{"field":"report_seconds","value":"300"},"id":3}"#,
        );
        assert_eq!(out.as_str(), r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#);
        assert_eq!(h.settings.readable().report_seconds, 60);

        h.call(r#"{"method":"save","id":4}"#);
        assert!(h.settings.commit());
        assert_eq!(h.settings.readable().report_seconds, 300);
        assert_eq!(settings::load(&mut h.store).report_seconds, 300);
    }

    #[test]
    fn invalid_value_is_reported() {
        let mut h = Harness::new();
        let out = h.call(
            r#"{"method":"set","params":{"field":"mqtt_port","value":"nope"},"id":5}"#,
        );
        assert_eq!(
            out.as_str(),
            r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32000,"message":"invalid value"}}"#
        );
    }

    #[test]
    fn set_without_value_is_invalid_params() {
        let mut h = Harness::new();
        let out = h.call(r#"{"method":"set","params":{"field":"mqtt_port"},"id":6}"#);
        assert!(out.contains("-32602"));
    }

    #[test]
    fn unknown_method_and_garbage() {
        let mut h = Harness::new();
        let out = h.call(r#"{"method":"reboot","id":9}"#);
        assert!(out.contains("method not found"));
        let out = h.call("not json");
        assert_eq!(
            out.as_str(),
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"parse error"}}"#
        );
        assert_eq!(h.status.rpc_requests, 2);
    }

    #[test]
    fn storage_recover_clears_flag() {
        let mut h = Harness::new();
        h.status.storage_error = true;
        h.call(r#"{"method":"storage_recover","id":1}"#);
        assert!(!h.status.storage_error);
    }

    #[test]
    fn reset_restores_defaults_in_writable_copy() {
        let mut h = Harness::new();
        h.settings
            .writable_mut()
            .set_field("ntp_server", "time.example")
            .unwrap();
        h.call(r#"{"method":"reset","id":1}"#);
        assert_eq!(h.settings.writable(), &Configuration::default());
    }

    #[test]
    fn status_reports_time_and_flags() {
        let mut h = Harness::new();
        h.status.records_published = 12;
        let out = h.call(r#"{"method":"status","id":8}"#);
        assert!(out.contains(r#""time":"2026-10-16T12:34:56""#));
        assert!(out.contains(r#""provider":"Unset""#));
        assert!(out.contains(r#""published":12"#));
    }

    #[test]
    fn string_values_are_escaped() {
        let mut h = Harness::new();
        h.settings
            .writable_mut()
            .set_field("ntp_server", "a\"b\\c")
            .unwrap();
        let out = h.call(r#"{"method":"get","params":{"field":"ntp_server"},"id":4}"#);
        assert_eq!(
            out.as_str(),
            r#"{"jsonrpc":"2.0","id":4,"result":{"field":"ntp_server","value":"a\"b\\c"}}"#
        );
    }

    #[test]
    fn status_without_clock_reports_null_time() {
        let mut h = Harness::new();
        let mut ctx = RpcContext {
            settings: &mut h.settings,
            config_store: &mut h.store,
            status: &mut h.status,
            epoch: None,
        };
        let mut out = Response::new();
        process(br#"{"method":"status","id":2}"#, &mut ctx, &mut out);
        assert!(out.starts_with(r#"{"jsonrpc":"2.0","id":2,"result":{"time":null,"provider":"Unset","#));
    }
}
