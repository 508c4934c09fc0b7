// Request parameters that may carry callbacks.

use serde_json::{Map, Value};

use super::callbacks::{Callback, CallbackRegistry};

/// Parameter tree. `Callback` leaves are registered and replaced by placeholders when the
/// request is encoded.
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    Callback(Callback),
    Object(Vec<(String, Arg)>),
    Array(Vec<Arg>),
}

impl Arg {
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Arg)>,
    {
        Arg::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn callback_count(&self) -> usize {
        match self {
            Arg::Value(_) => 0,
            Arg::Callback(_) => 1,
            Arg::Object(fields) => fields.iter().map(|(_, arg)| arg.callback_count()).sum(),
            Arg::Array(items) => items.iter().map(Arg::callback_count).sum(),
        }
    }

    /// Register every callback under `owner` and produce the wire value.
    pub(crate) fn encode(self, registry: &CallbackRegistry, owner: Option<u64>) -> Value {
        match self {
            Arg::Value(value) => value,
            Arg::Callback(callback) => registry.register(owner, callback).placeholder(),
            Arg::Object(fields) => {
                let mut object = Map::with_capacity(fields.len());
                for (key, arg) in fields {
                    object.insert(key, arg.encode(registry, owner));
                }
                Value::Object(object)
            }
            Arg::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|arg| arg.encode(registry, owner))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<Callback> for Arg {
    fn from(callback: Callback) -> Self {
        Arg::Callback(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::CallbackId;
    use serde_json::json;

    #[test]
    fn callbacks_become_placeholders() {
        let registry = CallbackRegistry::new();
        let arg = Arg::object([
            ("files", Arg::from(json!(["a.esp"]))),
            (
                "ui",
                Arg::object([(
                    "startDialog",
                    Arg::from(Callback::persistent(|_| async { Ok(Value::Null) })),
                )]),
            ),
        ]);
        assert_eq!(arg.callback_count(), 1);

        let value = arg.encode(&registry, Some(9));
        assert_eq!(value["files"], json!(["a.esp"]));
        let id = CallbackId::from_placeholder(&value["ui"]["startDialog"]).unwrap();
        assert!(registry.contains(&id));
        assert_eq!(registry.release_owner(9), 1);
    }
}
