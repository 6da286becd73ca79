//! JSON encoding/decoding for the wire protocol.
//!
//! Each line on the wire is a single JSON object with no embedded newline.
//! `appose_type` is the discriminant for the three non-primitive
//! [`Value`] variants that need out-of-band (shared-memory) backing:
//! `shm`, `ndarray`, and `worker_object`. Everything else round-trips
//! through the obvious JSON primitive/array/object mapping.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Number, Value as Json};

use crate::context;
use crate::error::CodecError;
use crate::protocol::{Request, RequestPayload, Response, ResponsePayload};
use crate::value::{Args, NDArrayRef, ShmRef, Value, WorkerObjectRef};

static AUTO_EXPORT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh `_appose_auto_{N}` variable name for worker-mode auto-export.
pub fn next_auto_export_name() -> String {
    let n = AUTO_EXPORT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("_appose_auto_{n}")
}

/// Encode a [`Value`] to its JSON representation.
///
/// Every variant but [`Value::Opaque`] has a direct JSON encoding.
/// `Value::Opaque` is the one worker-side value with no JSON shape of its
/// own: encoding one calls [`context::auto_export`] to bind it to a fresh
/// [`Value::WorkerObject`] name in the worker's export registry (see
/// [`crate::worker`]), and emits the resulting `worker_object` sentinel in
/// its place. `Value::Proxy` never reaches this function in practice (it
/// is a caller-side-only value the service itself constructs) but encodes
/// as `null` rather than panicking, for robustness.
pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number(Number::from(*i)),
        Value::Float(x) => Number::from_f64(*x).map(Json::Number).unwrap_or(Json::Null),
        Value::String(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Map(map) => Json::Object(args_to_json(map)),
        Value::Shm(shm) => shm_to_json(shm),
        Value::NDArray(nd) => ndarray_to_json(nd),
        Value::WorkerObject(w) => worker_object_to_json(w),
        Value::Proxy(_) => Json::Null,
        Value::Opaque(_) | Value::Callable(_) => match context::auto_export(value.clone()) {
            Some(var_name) => worker_object_to_json(&WorkerObjectRef { var_name }),
            None => Json::Null,
        },
    }
}

fn shm_to_json(shm: &ShmRef) -> Json {
    let mut obj = Map::new();
    obj.insert("appose_type".into(), Json::String("shm".into()));
    obj.insert("name".into(), Json::String(shm.name.clone()));
    obj.insert("rsize".into(), Json::Number(Number::from(shm.rsize as u64)));
    Json::Object(obj)
}

fn ndarray_to_json(nd: &NDArrayRef) -> Json {
    let mut obj = Map::new();
    obj.insert("appose_type".into(), Json::String("ndarray".into()));
    obj.insert("dtype".into(), Json::String(nd.dtype.clone()));
    obj.insert(
        "shape".into(),
        Json::Array(
            nd.shape
                .iter()
                .map(|&n| Json::Number(Number::from(n as u64)))
                .collect(),
        ),
    );
    obj.insert("shm".into(), shm_to_json(&nd.shm));
    Json::Object(obj)
}

fn worker_object_to_json(w: &WorkerObjectRef) -> Json {
    let mut obj = Map::new();
    obj.insert("appose_type".into(), Json::String("worker_object".into()));
    obj.insert("var_name".into(), Json::String(w.var_name.clone()));
    Json::Object(obj)
}

fn args_to_json(args: &Args) -> Map<String, Json> {
    let mut obj = Map::new();
    for (k, v) in args {
        obj.insert(k.clone(), value_to_json(v));
    }
    obj
}

/// Decode a JSON value into a [`Value`], recognizing `appose_type`
/// wrappers along the way.
pub fn json_to_value(json: &Json) -> Result<Value, CodecError> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else {
                Ok(Value::Float(n.as_f64().unwrap_or(0.0)))
            }
        }
        Json::String(s) => Ok(Value::String(s.clone())),
        Json::Array(items) => {
            let decoded: Result<Vec<Value>, CodecError> =
                items.iter().map(json_to_value).collect();
            Ok(Value::List(decoded?))
        }
        Json::Object(obj) => decode_object(obj),
    }
}

fn decode_object(obj: &Map<String, Json>) -> Result<Value, CodecError> {
    match obj.get("appose_type").and_then(Json::as_str) {
        Some("shm") => Ok(Value::Shm(decode_shm(obj)?)),
        Some("ndarray") => Ok(Value::NDArray(decode_ndarray(obj)?)),
        Some("worker_object") => Ok(Value::WorkerObject(decode_worker_object(obj)?)),
        _ => {
            let mut map = Args::new();
            for (k, v) in obj {
                map.insert(k.clone(), json_to_value(v)?);
            }
            Ok(Value::Map(map))
        }
    }
}

fn decode_shm(obj: &Map<String, Json>) -> Result<ShmRef, CodecError> {
    let name = field_str(obj, "name")?.to_string();
    let rsize = field_u64(obj, "rsize")? as usize;
    Ok(ShmRef { name, rsize })
}

fn decode_ndarray(obj: &Map<String, Json>) -> Result<NDArrayRef, CodecError> {
    let dtype = field_str(obj, "dtype")?.to_string();
    let shape_json = obj
        .get("shape")
        .and_then(Json::as_array)
        .ok_or(CodecError::MissingField("shape"))?;
    let mut shape = Vec::with_capacity(shape_json.len());
    for dim in shape_json {
        let n = dim.as_u64().ok_or(CodecError::MissingField("shape"))?;
        shape.push(n as usize);
    }
    let shm_json = obj
        .get("shm")
        .and_then(Json::as_object)
        .ok_or(CodecError::MissingField("shm"))?;
    let shm = decode_shm(shm_json)?;
    Ok(NDArrayRef { dtype, shape, shm })
}

fn decode_worker_object(obj: &Map<String, Json>) -> Result<WorkerObjectRef, CodecError> {
    let var_name = field_str(obj, "var_name")?.to_string();
    Ok(WorkerObjectRef { var_name })
}

fn field_str<'a>(obj: &'a Map<String, Json>, name: &'static str) -> Result<&'a str, CodecError> {
    obj.get(name)
        .and_then(Json::as_str)
        .ok_or(CodecError::MissingField(name))
}

fn field_u64(obj: &Map<String, Json>, name: &'static str) -> Result<u64, CodecError> {
    obj.get(name)
        .and_then(Json::as_u64)
        .ok_or(CodecError::MissingField(name))
}

/// Decode a full `Args` map from raw JSON text (a request's `inputs`, or a
/// response's `outputs`/`info`).
pub fn decode_args(json: &Json) -> Result<Args, CodecError> {
    match json {
        Json::Object(obj) => {
            let mut map = Args::new();
            for (k, v) in obj {
                map.insert(k.clone(), json_to_value(v)?);
            }
            Ok(map)
        }
        Json::Null => Ok(Args::new()),
        _ => Err(CodecError::MissingField("inputs")),
    }
}

fn args_to_json_plain(args: &Args) -> Json {
    Json::Object(args_to_json(args))
}

/// Serialize a [`Request`] as a single line of JSON (no trailing newline;
/// the caller writes the newline framing).
pub fn encode_request(req: &Request) -> String {
    let mut obj = Map::new();
    obj.insert("task".into(), Json::String(req.task.clone()));
    match &req.payload {
        RequestPayload::Execute {
            script,
            inputs,
            queue,
        } => {
            obj.insert("requestType".into(), Json::String("EXECUTE".into()));
            obj.insert("script".into(), Json::String(script.clone()));
            obj.insert("inputs".into(), args_to_json_plain(inputs));
            if let Some(q) = queue {
                obj.insert("queue".into(), Json::String(q.clone()));
            }
        }
        RequestPayload::Cancel => {
            obj.insert("requestType".into(), Json::String("CANCEL".into()));
        }
    }
    Json::Object(obj).to_string()
}

/// Parse a single line of JSON as a [`Request`].
pub fn decode_request(line: &str) -> Result<Request, CodecError> {
    let json: Json = serde_json::from_str(line)?;
    let obj = json.as_object().ok_or(CodecError::MissingField("task"))?;
    let task = field_str(obj, "task")?.to_string();
    let request_type = field_str(obj, "requestType")?;
    let payload = match request_type {
        "EXECUTE" => {
            let script = field_str(obj, "script")?.to_string();
            let inputs = obj
                .get("inputs")
                .map(decode_args)
                .transpose()?
                .unwrap_or_default();
            let queue = obj
                .get("queue")
                .and_then(Json::as_str)
                .map(|s| s.to_string());
            RequestPayload::Execute {
                script,
                inputs,
                queue,
            }
        }
        "CANCEL" => RequestPayload::Cancel,
        other => return Err(CodecError::InvalidMessageType(other.to_string())),
    };
    Ok(Request { task, payload })
}

/// Serialize a [`Response`] as a single line of JSON.
pub fn encode_response(resp: &Response) -> String {
    let mut obj = Map::new();
    obj.insert("task".into(), Json::String(resp.task.clone()));
    match &resp.payload {
        ResponsePayload::Launch => {
            obj.insert("responseType".into(), Json::String("LAUNCH".into()));
        }
        ResponsePayload::Update {
            message,
            current,
            maximum,
            info,
        } => {
            obj.insert("responseType".into(), Json::String("UPDATE".into()));
            if let Some(m) = message {
                obj.insert("message".into(), Json::String(m.clone()));
            }
            if let Some(c) = current {
                obj.insert("current".into(), Json::Number(Number::from(*c)));
            }
            if let Some(m) = maximum {
                obj.insert("maximum".into(), Json::Number(Number::from(*m)));
            }
            if let Some(i) = info {
                obj.insert("info".into(), args_to_json_plain(i));
            }
        }
        ResponsePayload::Completion { outputs } => {
            obj.insert("responseType".into(), Json::String("COMPLETION".into()));
            obj.insert("outputs".into(), args_to_json_plain(outputs));
        }
        ResponsePayload::Cancelation => {
            obj.insert("responseType".into(), Json::String("CANCELATION".into()));
        }
        ResponsePayload::Failure { error } => {
            obj.insert("responseType".into(), Json::String("FAILURE".into()));
            if let Some(e) = error {
                obj.insert("error".into(), Json::String(e.clone()));
            }
        }
        ResponsePayload::Crash { error } => {
            obj.insert("responseType".into(), Json::String("CRASH".into()));
            obj.insert("error".into(), Json::String(error.clone()));
        }
    }
    Json::Object(obj).to_string()
}

/// Parse a single line of JSON as a [`Response`]. `CRASH` is never produced
/// here; it is synthesized directly by [`crate::service`] on process exit.
pub fn decode_response(line: &str) -> Result<Response, CodecError> {
    let json: Json = serde_json::from_str(line)?;
    let obj = json.as_object().ok_or(CodecError::MissingField("task"))?;
    let task = field_str(obj, "task")?.to_string();
    let response_type = field_str(obj, "responseType")?;
    let payload = match response_type {
        "LAUNCH" => ResponsePayload::Launch,
        "UPDATE" => ResponsePayload::Update {
            message: obj.get("message").and_then(Json::as_str).map(str::to_string),
            current: obj.get("current").and_then(Json::as_i64),
            maximum: obj.get("maximum").and_then(Json::as_i64),
            info: obj.get("info").map(decode_args).transpose()?,
        },
        "COMPLETION" => ResponsePayload::Completion {
            outputs: obj
                .get("outputs")
                .map(decode_args)
                .transpose()?
                .unwrap_or_default(),
        },
        "CANCELATION" => ResponsePayload::Cancelation,
        "FAILURE" => ResponsePayload::Failure {
            error: obj.get("error").and_then(Json::as_str).map(str::to_string),
        },
        other => return Err(CodecError::InvalidMessageType(other.to_string())),
    };
    Ok(Response { task, payload })
}

/// True iff the current process is a worker (see [`context::is_worker_process`]).
/// Exposed here so callers building an auto-export path don't need to
/// depend on [`context`] directly.
pub fn in_worker_process() -> bool {
    context::is_worker_process()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitive_values() {
        let mut args = Args::new();
        args.insert("a".to_string(), Value::Int(42));
        args.insert("b".to_string(), Value::String("hi".to_string()));
        args.insert("c".to_string(), Value::Bool(true));
        args.insert("d".to_string(), Value::Null);
        args.insert(
            "e".to_string(),
            Value::List(vec![Value::Int(1), Value::Int(2)]),
        );

        let json = args_to_json_plain(&args);
        let decoded = decode_args(&json).expect("decode");
        assert_eq!(decoded, args);
    }

    #[test]
    fn shm_ref_round_trips_with_appose_type_tag() {
        let shm = ShmRef {
            name: "/appose-1-2".to_string(),
            rsize: 128,
        };
        let json = shm_to_json(&shm);
        assert_eq!(json["appose_type"], "shm");
        let value = json_to_value(&json).expect("decode");
        assert_eq!(value, Value::Shm(shm));
    }

    #[test]
    fn ndarray_ref_round_trips_with_nested_shm() {
        let nd = NDArrayRef {
            dtype: "uint16".to_string(),
            shape: vec![2, 20, 25],
            shm: ShmRef {
                name: "/appose-1-3".to_string(),
                rsize: 2000,
            },
        };
        let json = ndarray_to_json(&nd);
        assert_eq!(json["appose_type"], "ndarray");
        let value = json_to_value(&json).expect("decode");
        assert_eq!(value, Value::NDArray(nd));
    }

    #[test]
    fn worker_object_round_trips() {
        let w = WorkerObjectRef {
            var_name: "_appose_auto_0".to_string(),
        };
        let json = worker_object_to_json(&w);
        let value = json_to_value(&json).expect("decode");
        assert_eq!(value, Value::WorkerObject(w));
    }

    #[test]
    fn request_round_trips() {
        let mut inputs = Args::new();
        inputs.insert("n".to_string(), Value::Int(7));
        let req = Request {
            task: "task-1".to_string(),
            payload: RequestPayload::Execute {
                script: "task.outputs['n'] = n".to_string(),
                inputs,
                queue: Some("main".to_string()),
            },
        };
        let line = encode_request(&req);
        assert!(!line.contains('\n'));
        let decoded = decode_request(&line).expect("decode");
        assert_eq!(decoded.task, req.task);
        assert!(matches!(decoded.payload, RequestPayload::Execute { .. }));
    }

    #[test]
    fn response_round_trips_completion() {
        let mut outputs = Args::new();
        outputs.insert("result".to_string(), Value::Int(1));
        let resp = Response {
            task: "task-1".to_string(),
            payload: ResponsePayload::Completion { outputs },
        };
        let line = encode_response(&resp);
        let decoded = decode_response(&line).expect("decode");
        assert_eq!(decoded.task, resp.task);
        assert!(matches!(decoded.payload, ResponsePayload::Completion { .. }));
    }

    #[test]
    fn response_round_trips_update_with_progress() {
        let resp = Response {
            task: "task-2".to_string(),
            payload: ResponsePayload::Update {
                message: Some("working".to_string()),
                current: Some(3),
                maximum: Some(10),
                info: None,
            },
        };
        let line = encode_response(&resp);
        let decoded = decode_response(&line).expect("decode");
        match decoded.payload {
            ResponsePayload::Update {
                message,
                current,
                maximum,
                ..
            } => {
                assert_eq!(message.as_deref(), Some("working"));
                assert_eq!(current, Some(3));
                assert_eq!(maximum, Some(10));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn decode_request_rejects_unknown_request_type() {
        let err = decode_request(r#"{"task":"t","requestType":"BOGUS"}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMessageType(_)));
    }

    #[test]
    fn auto_export_names_are_unique() {
        let a = next_auto_export_name();
        let b = next_auto_export_name();
        assert_ne!(a, b);
        assert!(a.starts_with("_appose_auto_"));
    }

    #[test]
    fn worker_object_sentinel_encodes_directly() {
        let name = next_auto_export_name();
        let value = Value::WorkerObject(WorkerObjectRef {
            var_name: name.clone(),
        });
        let json = value_to_json(&value);
        assert_eq!(json["appose_type"], "worker_object");
        assert_eq!(json["var_name"], name);
    }
}
