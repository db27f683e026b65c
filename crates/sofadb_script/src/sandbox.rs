//! One interpreter instance with compiled-function reuse.

use std::cell::RefCell;
use std::collections::HashMap;

use boa_engine::object::JsObject;
use boa_engine::{js_string, Context, JsResult, JsValue, NativeFunction, Source};
use serde_json::Value;

use crate::{ScriptError, ScriptResult};

// Emissions collected by the global `emit` while a map invocation runs.
// Interpreters are thread-bound, so a thread-local is the natural mailbox.
thread_local! {
    static EMITS: RefCell<Vec<(Value, Value)>> = const { RefCell::new(Vec::new()) };
}

/// Globals installed into every interpreter before user code runs.
///
/// `Date.now` and `Math.random` are replaced to keep map output
/// deterministic; `sum` and `log` mirror the helpers CouchDB's JS query
/// server provides.
const PRELUDE: &str = r#"
(function() {
    var seed = 0x5eed;
    Math.random = function() {
        seed ^= seed << 13;
        seed ^= seed >>> 17;
        seed ^= seed << 5;
        seed = seed >>> 0;
        return seed / 4294967296;
    };
    var epoch = 1700000000000;
    Date.now = function() { return epoch; };
    globalThis.log = function() {};
    globalThis.sum = function(values) {
        var s = 0;
        for (var i = 0; i < values.length; i++) { s += values[i]; }
        return s;
    };
    globalThis.toJSON = function(v) { return JSON.stringify(v); };
})();
"#;

/// Result of one map invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapOutcome {
    /// Collected `(key, value)` pairs, in emission order.
    pub pairs: Vec<(Value, Value)>,
    /// Failure message if the invocation threw or emitted an
    /// unserializable value. When set, `pairs` is empty.
    pub failure: Option<String>,
}

impl MapOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            pairs: Vec::new(),
            failure: Some(message.into()),
        }
    }
}

/// Verdict of a `validate_doc_update` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The write is allowed.
    Ok,
    /// The function threw `{forbidden: ...}` (or a plain error).
    Forbidden(String),
    /// The function threw `{unauthorized: ...}`.
    Unauthorized(String),
}

/// A single-threaded interpreter with a compile cache.
///
/// Construction installs the `emit` collector and the determinism prelude,
/// and applies loop/recursion limits so runaway user code cannot wedge an
/// indexing pass.
pub struct Sandbox {
    context: Context,
    compiled: HashMap<String, JsObject>,
}

impl Sandbox {
    /// Builds a fresh interpreter.
    pub fn new() -> ScriptResult<Self> {
        let mut context = Context::default();
        context.runtime_limits_mut().set_loop_iteration_limit(1 << 24);
        context.runtime_limits_mut().set_recursion_limit(256);
        context
            .register_global_callable(js_string!("emit"), 2, NativeFunction::from_fn_ptr(emit))
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        context
            .eval(Source::from_bytes(PRELUDE))
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        Ok(Self {
            context,
            compiled: HashMap::new(),
        })
    }

    /// Compiles `source` to a callable, reusing a prior compilation of the
    /// same source.
    fn compile(&mut self, source: &str) -> ScriptResult<JsObject> {
        if let Some(func) = self.compiled.get(source) {
            return Ok(func.clone());
        }
        let wrapped = format!("({source})");
        let value = self
            .context
            .eval(Source::from_bytes(&wrapped))
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        let func = value
            .as_callable()
            .cloned()
            .ok_or_else(|| ScriptError::Compile("source is not a function".into()))?;
        self.compiled.insert(source.to_owned(), func.clone());
        Ok(func)
    }

    /// Checks that `source` compiles to a function, without calling it.
    pub fn check(&mut self, source: &str) -> ScriptResult<()> {
        self.compile(source).map(|_| ())
    }

    /// Runs a map function over one document.
    ///
    /// A throw, or an `emit` argument that cannot be serialized to JSON,
    /// turns the whole invocation into a failure with zero pairs.
    pub fn call_map(&mut self, source: &str, doc: &Value) -> MapOutcome {
        let func = match self.compile(source) {
            Ok(f) => f,
            Err(e) => return MapOutcome::failed(e.to_string()),
        };
        let arg = match JsValue::from_json(doc, &mut self.context) {
            Ok(v) => v,
            Err(e) => return MapOutcome::failed(e.to_string()),
        };
        EMITS.with(|e| e.borrow_mut().clear());
        match func.call(&JsValue::undefined(), &[arg], &mut self.context) {
            Ok(_) => MapOutcome {
                pairs: EMITS.with(|e| std::mem::take(&mut *e.borrow_mut())),
                failure: None,
            },
            Err(e) => {
                EMITS.with(|e| e.borrow_mut().clear());
                MapOutcome::failed(e.to_string())
            }
        }
    }

    /// Runs a reduce function.
    ///
    /// `keys` pairs each emitted key with the emitting document's id (empty
    /// for re-reduce inputs). Returns the failure message on throw; the
    /// caller substitutes `null` and logs.
    pub fn call_reduce(
        &mut self,
        source: &str,
        keys: &[(Value, String)],
        values: &[Value],
        rereduce: bool,
    ) -> Result<Value, String> {
        let func = self.compile(source).map_err(|e| e.to_string())?;

        let keys_json = Value::Array(
            keys.iter()
                .map(|(k, id)| Value::Array(vec![k.clone(), Value::String(id.clone())]))
                .collect(),
        );
        let values_json = Value::Array(values.to_vec());
        let keys_arg =
            JsValue::from_json(&keys_json, &mut self.context).map_err(|e| e.to_string())?;
        let values_arg =
            JsValue::from_json(&values_json, &mut self.context).map_err(|e| e.to_string())?;

        let result = func
            .call(
                &JsValue::undefined(),
                &[keys_arg, values_arg, JsValue::from(rereduce)],
                &mut self.context,
            )
            .map_err(|e| e.to_string())?;
        json_or_null(&result, &mut self.context)
    }

    /// Runs a changes filter function. Exceptions exclude the document.
    pub fn call_filter(&mut self, source: &str, doc: &Value) -> Result<bool, String> {
        let func = self.compile(source).map_err(|e| e.to_string())?;
        let doc_arg = JsValue::from_json(doc, &mut self.context).map_err(|e| e.to_string())?;
        let req_arg = JsValue::from_json(&Value::Object(serde_json::Map::new()), &mut self.context)
            .map_err(|e| e.to_string())?;
        let result = func
            .call(&JsValue::undefined(), &[doc_arg, req_arg], &mut self.context)
            .map_err(|e| e.to_string())?;
        Ok(result.to_boolean())
    }

    /// Runs a `validate_doc_update` function.
    pub fn call_validate(
        &mut self,
        source: &str,
        new_doc: &Value,
        old_doc: &Value,
        user_ctx: &Value,
    ) -> ValidationOutcome {
        let func = match self.compile(source) {
            Ok(f) => f,
            Err(e) => return ValidationOutcome::Forbidden(e.to_string()),
        };
        let args = [new_doc, old_doc, user_ctx]
            .iter()
            .map(|v| JsValue::from_json(v, &mut self.context))
            .collect::<JsResult<Vec<_>>>();
        let args = match args {
            Ok(a) => a,
            Err(e) => return ValidationOutcome::Forbidden(e.to_string()),
        };
        match func.call(&JsValue::undefined(), &args, &mut self.context) {
            Ok(_) => ValidationOutcome::Ok,
            Err(err) => self.classify_validation_error(&err),
        }
    }

    /// A thrown `{forbidden: msg}` is Forbidden, `{unauthorized: msg}` is
    /// Unauthorized, anything else is Forbidden with the error text.
    fn classify_validation_error(&mut self, err: &boa_engine::JsError) -> ValidationOutcome {
        if let Some(opaque) = err.as_opaque() {
            if let Some(obj) = opaque.as_object() {
                for (field, unauthorized) in [("forbidden", false), ("unauthorized", true)] {
                    if let Ok(v) = obj.get(boa_engine::JsString::from(field), &mut self.context) {
                        if !v.is_undefined() {
                            let msg = v
                                .to_string(&mut self.context)
                                .map(|s| s.to_std_string_escaped())
                                .unwrap_or_default();
                            return if unauthorized {
                                ValidationOutcome::Unauthorized(msg)
                            } else {
                                ValidationOutcome::Forbidden(msg)
                            };
                        }
                    }
                }
            }
        }
        ValidationOutcome::Forbidden(err.to_string())
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("compiled", &self.compiled.len())
            .finish_non_exhaustive()
    }
}

/// The global `emit(key, value)` installed into every interpreter.
///
/// Missing or `undefined` arguments become `null`; values that cannot be
/// serialized (functions, symbols) raise, which fails the invocation.
fn emit(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let key = args.first().cloned().unwrap_or_default();
    let value = args.get(1).cloned().unwrap_or_default();
    let key = serialize_arg(&key, context)?;
    let value = serialize_arg(&value, context)?;
    EMITS.with(|e| e.borrow_mut().push((key, value)));
    Ok(JsValue::undefined())
}

fn serialize_arg(v: &JsValue, context: &mut Context) -> JsResult<Value> {
    if v.is_undefined() || v.is_null() {
        return Ok(Value::Null);
    }
    if v.as_callable().is_some() {
        return Err(boa_engine::JsNativeError::typ()
            .with_message("emitted value cannot be serialized to JSON")
            .into());
    }
    v.to_json(context)
}

fn json_or_null(v: &JsValue, context: &mut Context) -> Result<Value, String> {
    if v.is_undefined() || v.is_null() {
        return Ok(Value::Null);
    }
    v.to_json(context).map_err(|e| e.to_string())
}
