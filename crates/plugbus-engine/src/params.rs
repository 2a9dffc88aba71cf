//! Typed views of each method's positional params.

use std::collections::HashSet;
use std::fmt;

use plugbus_core::{PluginKey, Value, KEY_LEN};
use plugbus_store::{FunctionSpec, PluginManifest};

use crate::error::DispatchError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Connect,
    Register,
    Run,
    Result,
    Broadcast,
    Subscribe,
    Unsubscribe,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "connect" => Self::Connect,
            "register" => Self::Register,
            "run" => Self::Run,
            "result" => Self::Result,
            "broadcast" => Self::Broadcast,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Register => "register",
            Self::Run => "run",
            Self::Result => "result",
            Self::Broadcast => "broadcast",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunParams {
    pub target: PluginKey,
    pub function: String,
    pub args: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResultParams {
    pub call_id: u64,
    pub args: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastParams {
    pub event: String,
    pub args: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionParams {
    /// Opaque token echoed back in the success response.
    pub id: Value,
    pub event: String,
}

fn invalid(method: Method, reason: impl fmt::Display) -> DispatchError {
    DispatchError::Validation(format!("invalid `{method}` params: {reason}"))
}

fn take_string(value: Value, method: Method, what: &str) -> Result<String, DispatchError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(invalid(method, format!("{what} must be a string, got {}", other.kind()))),
    }
}

fn take_key(value: &Value, method: Method) -> Result<PluginKey, DispatchError> {
    value
        .as_bytes()
        .and_then(|b| PluginKey::from_slice(b).ok())
        .ok_or_else(|| invalid(method, format!("plugin key must be {KEY_LEN} bytes of binary")))
}

fn exact<const N: usize>(params: Vec<Value>, method: Method) -> Result<[Value; N], DispatchError> {
    let len = params.len();
    params
        .try_into()
        .map_err(|_| invalid(method, format!("expected {N} elements, got {len}")))
}

/// `connect`: `[key_bin32]`.
pub fn parse_connect(params: Vec<Value>) -> Result<PluginKey, DispatchError> {
    let [key] = exact::<1>(params, Method::Connect)?;
    take_key(&key, Method::Connect)
}

/// `register`: `[[name, description, author, license], functions]`, or the
/// flat `[name, description, author, license, functions]`.
pub fn parse_register(params: Vec<Value>) -> Result<PluginManifest, DispatchError> {
    const M: Method = Method::Register;
    let (meta, functions) = match params.len() {
        2 => {
            let [meta, functions] = exact::<2>(params, M)?;
            let meta = meta
                .into_array()
                .ok_or_else(|| invalid(M, "plugin metadata must be an array"))?;
            (meta, functions)
        }
        5 => {
            let mut params = params;
            let functions = params.pop().unwrap_or(Value::Nil);
            (params, functions)
        }
        n => return Err(invalid(M, format!("expected 2 or 5 elements, got {n}"))),
    };

    let [name, description, author, license] = exact::<4>(meta, M)?;
    let functions = functions
        .into_array()
        .ok_or_else(|| invalid(M, "functions must be an array"))?;

    let mut seen = HashSet::new();
    let functions = functions
        .into_iter()
        .map(|f| {
            let spec = parse_function(f)?;
            if !seen.insert(spec.name.clone()) {
                return Err(invalid(M, format!("function `{}` declared twice", spec.name)));
            }
            Ok(spec)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PluginManifest {
        name: take_string(name, M, "name")?,
        description: take_string(description, M, "description")?,
        author: take_string(author, M, "author")?,
        license: take_string(license, M, "license")?,
        functions,
    })
}

/// One function declaration: `[name, description, args]` where each arg is
/// an exemplar whose kind becomes the declared kind.
fn parse_function(value: Value) -> Result<FunctionSpec, DispatchError> {
    const M: Method = Method::Register;
    let fields = value
        .into_array()
        .ok_or_else(|| invalid(M, "function declaration must be an array"))?;
    let [name, description, args] = exact::<3>(fields, M)?;
    let name = take_string(name, M, "function name")?;
    if name.is_empty() {
        return Err(invalid(M, "function name is empty"));
    }
    let args = args
        .as_array()
        .ok_or_else(|| invalid(M, "function args must be an array"))?
        .iter()
        .map(Value::kind)
        .collect();
    Ok(FunctionSpec {
        name,
        description: take_string(description, M, "function description")?,
        args,
    })
}

/// `run`: `[[target_key_bin32, nil], function_name, args]`.
pub fn parse_run(params: Vec<Value>) -> Result<RunParams, DispatchError> {
    const M: Method = Method::Run;
    let [meta, function, args] = exact::<3>(params, M)?;
    let target = match meta.as_array() {
        Some([key, ..]) => take_key(key, M)?,
        _ => return Err(invalid(M, "first element must be [target_key, nil]")),
    };
    Ok(RunParams {
        target,
        function: take_string(function, M, "function name")?,
        args: args
            .into_array()
            .ok_or_else(|| invalid(M, "args must be an array"))?,
    })
}

/// `result`: `[call_id, args...]`.
pub fn parse_result(params: Vec<Value>) -> Result<ResultParams, DispatchError> {
    let mut params = params.into_iter();
    let call_id = params
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| invalid(Method::Result, "first element must be the call id"))?;
    Ok(ResultParams {
        call_id,
        args: params.collect(),
    })
}

/// `broadcast`: `[event_name, args...]`.
pub fn parse_broadcast(params: Vec<Value>) -> Result<BroadcastParams, DispatchError> {
    let mut params = params.into_iter();
    let event = params
        .next()
        .ok_or_else(|| invalid(Method::Broadcast, "missing event name"))?;
    Ok(BroadcastParams {
        event: take_string(event, Method::Broadcast, "event name")?,
        args: params.collect(),
    })
}

/// `subscribe` / `unsubscribe`: `[id, event_name]`.
pub fn parse_subscription(params: Vec<Value>, method: Method) -> Result<SubscriptionParams, DispatchError> {
    let [id, event] = exact::<2>(params, method)?;
    Ok(SubscriptionParams {
        id,
        event: take_string(event, method, "event name")?,
    })
}
