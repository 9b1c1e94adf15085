//! The `__type`-tagged JSON wire form (spec.md §4.3, §6.1). `Wire` is the
//! only thing that is ever actually serialized; `duplex_protocol::Value` is
//! the live, in-process representation on either side of the boundary.
use indexmap::IndexMap;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as Json};

#[derive(Debug, Clone, PartialEq)]
pub enum Wire {
    Null,
    /// `{"__type":"undefined"}` — JSON has no literal for this, so it gets
    /// its own envelope to round-trip distinctly from `Null` (spec.md §4.3
    /// rule 1, and rule 3's "decode → undefined").
    Undefined,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Wire>),
    Object(IndexMap<String, Wire>),
    /// `{"__type":"circular"}` (rule 3).
    Circular,
    /// `{"__type":"function",__fnId,__source?}` (rule 4/5).
    Function { fn_id: String, source: Option<String> },
    /// `{"__type":"promise",__promiseId}` (rule 6/7).
    Promise { promise_id: String },
    /// `{"__type":"date",__value:iso}` (rule 8).
    Date(String),
    /// `{"__type":"regexp",__source,__flags}` (rule 9).
    Regexp { source: String, flags: String },
    /// `{"__type":"error",__name,__message,__stack?}` (rule 10).
    Error { name: String, message: String, stack: Option<String> },
    /// `{"__type":"map",__entries:[[k,v]...]}` (rule 11).
    Map(Vec<(Wire, Wire)>),
    /// `{"__type":"set",__values:[...]}` (rule 12).
    Set(Vec<Wire>),
    /// `{"__type":"typedarray",__ctor,__data,__bigint?}` (rule 13).
    TypedArray { ctor: Option<String>, data: Vec<u8>, bigint: bool },
    /// `{"__type":"arraybuffer",__data:[u8...]}` (rule 14).
    ArrayBuffer(Vec<u8>),
}

impl Wire {
    pub fn to_json(&self) -> Json {
        match self {
            Wire::Null => Json::Null,
            Wire::Undefined => json!({"__type": "undefined"}),
            Wire::Bool(b) => json!(b),
            Wire::Number(n) => json!(n),
            Wire::String(s) => json!(s),
            Wire::Array(items) => Json::Array(items.iter().map(Wire::to_json).collect()),
            Wire::Object(map) => {
                Json::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
            Wire::Circular => json!({"__type": "circular"}),
            Wire::Function { fn_id, source } => {
                json!({"__type": "function", "__fnId": fn_id, "__source": source})
            }
            Wire::Promise { promise_id } => {
                json!({"__type": "promise", "__promiseId": promise_id})
            }
            Wire::Date(iso) => json!({"__type": "date", "__value": iso}),
            Wire::Regexp { source, flags } => {
                json!({"__type": "regexp", "__source": source, "__flags": flags})
            }
            Wire::Error { name, message, stack } => {
                json!({"__type": "error", "__name": name, "__message": message, "__stack": stack})
            }
            Wire::Map(entries) => json!({
                "__type": "map",
                "__entries": entries.iter().map(|(k, v)| json!([k.to_json(), v.to_json()])).collect::<Vec<_>>(),
            }),
            Wire::Set(values) => json!({
                "__type": "set",
                "__values": values.iter().map(Wire::to_json).collect::<Vec<_>>(),
            }),
            Wire::TypedArray { ctor, data, bigint } => json!({
                "__type": "typedarray",
                "__ctor": ctor,
                "__data": data,
                "__bigint": bigint,
            }),
            Wire::ArrayBuffer(data) => json!({"__type": "arraybuffer", "__data": data}),
        }
    }

    pub fn from_json(v: Json) -> Result<Wire, String> {
        match v {
            Json::Null => Ok(Wire::Null),
            Json::Bool(b) => Ok(Wire::Bool(b)),
            Json::Number(n) => Ok(Wire::Number(n.as_f64().ok_or("non-finite number")?)),
            Json::String(s) => Ok(Wire::String(s)),
            Json::Array(items) => {
                Ok(Wire::Array(items.into_iter().map(Wire::from_json).collect::<Result<_, _>>()?))
            }
            Json::Object(map) => {
                if let Some(Json::String(ty)) = map.get("__type") {
                    return Wire::envelope_from_json(ty.as_str(), &map);
                }
                let mut out = IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, Wire::from_json(v)?);
                }
                Ok(Wire::Object(out))
            }
        }
    }

    fn envelope_from_json(
        ty: &str,
        map: &serde_json::Map<String, Json>,
    ) -> Result<Wire, String> {
        fn field<'a>(map: &'a serde_json::Map<String, Json>, name: &str) -> Result<&'a Json, String> {
            map.get(name).ok_or_else(|| format!("envelope {name} missing"))
        }
        fn as_str(v: &Json) -> Result<String, String> {
            v.as_str().map(str::to_owned).ok_or_else(|| "expected string".to_string())
        }
        match ty {
            "undefined" => Ok(Wire::Undefined),
            "circular" => Ok(Wire::Circular),
            "function" => Ok(Wire::Function {
                fn_id: as_str(field(map, "__fnId")?)?,
                source: map.get("__source").and_then(|v| v.as_str()).map(str::to_owned),
            }),
            "promise" => Ok(Wire::Promise { promise_id: as_str(field(map, "__promiseId")?)? }),
            "date" => Ok(Wire::Date(as_str(field(map, "__value")?)?)),
            "regexp" => Ok(Wire::Regexp {
                source: as_str(field(map, "__source")?)?,
                flags: as_str(field(map, "__flags")?)?,
            }),
            "error" => Ok(Wire::Error {
                name: as_str(field(map, "__name")?)?,
                message: as_str(field(map, "__message")?)?,
                stack: map.get("__stack").and_then(|v| v.as_str()).map(str::to_owned),
            }),
            "map" => {
                let entries = field(map, "__entries")?
                    .as_array()
                    .ok_or("__entries must be an array")?;
                let mut out = Vec::with_capacity(entries.len());
                for e in entries {
                    let pair = e.as_array().ok_or("map entry must be a pair")?;
                    let (k, v) = (
                        pair.first().ok_or("map entry missing key")?.clone(),
                        pair.get(1).ok_or("map entry missing value")?.clone(),
                    );
                    out.push((Wire::from_json(k)?, Wire::from_json(v)?));
                }
                Ok(Wire::Map(out))
            }
            "set" => {
                let values = field(map, "__values")?.as_array().ok_or("__values must be an array")?;
                Ok(Wire::Set(
                    values.iter().cloned().map(Wire::from_json).collect::<Result<_, _>>()?,
                ))
            }
            "typedarray" => Ok(Wire::TypedArray {
                ctor: map.get("__ctor").and_then(|v| v.as_str()).map(str::to_owned),
                data: bytes_from_json(field(map, "__data")?)?,
                bigint: map.get("__bigint").and_then(|v| v.as_bool()).unwrap_or(false),
            }),
            "arraybuffer" => Ok(Wire::ArrayBuffer(bytes_from_json(field(map, "__data")?)?)),
            other => Err(format!("unknown envelope __type {other}")),
        }
    }
}

fn bytes_from_json(v: &Json) -> Result<Vec<u8>, String> {
    v.as_array()
        .ok_or("__data must be an array of bytes")?
        .iter()
        .map(|b| b.as_u64().map(|b| b as u8).ok_or_else(|| "byte out of range".to_string()))
        .collect()
}

impl Serialize for Wire {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(s)
    }
}

impl<'de> Deserialize<'de> for Wire {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = Json::deserialize(d)?;
        Wire::from_json(v).map_err(DeError::custom)
    }
}

/// Wire shape of a single tree mutation (spec.md §4.1). Mirrors
/// `duplex_protocol::Op` field-for-field but with `Wire` in place of `Value`,
/// and derives its JSON shape directly since every field is already
/// `Serialize`/`Deserialize` via plain types or `Wire` itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum WireOp {
    Create {
        id: u32,
        #[serde(rename = "type")]
        type_: String,
        props: IndexMap<String, Wire>,
    },
    Update {
        id: u32,
        props: IndexMap<String, Wire>,
        #[serde(rename = "removedProps", default, skip_serializing_if = "Vec::is_empty")]
        removed_props: Vec<String>,
    },
    Append {
        #[serde(rename = "parentId")]
        parent_id: u32,
        #[serde(rename = "childId")]
        child_id: u32,
    },
    Insert {
        #[serde(rename = "parentId")]
        parent_id: u32,
        #[serde(rename = "childId")]
        child_id: u32,
        index: u32,
    },
    Remove {
        #[serde(rename = "parentId")]
        parent_id: u32,
        #[serde(rename = "childId")]
        child_id: u32,
    },
    Delete {
        id: u32,
    },
    Reorder {
        #[serde(rename = "parentId")]
        parent_id: u32,
        #[serde(rename = "childIds")]
        child_ids: Vec<u32>,
    },
    Text {
        id: u32,
        text: String,
    },
}

/// Wire shape of `duplex_protocol::OperationBatch` (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireOperationBatch {
    pub version: u32,
    #[serde(rename = "batchId")]
    pub batch_id: u64,
    pub operations: Vec<WireOp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_round_trips_through_json() {
        let w = Wire::Undefined;
        let s = serde_json::to_string(&w).unwrap();
        assert_eq!(s, r#"{"__type":"undefined"}"#);
        let back: Wire = serde_json::from_str(&s).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn plain_object_round_trips() {
        let mut obj = IndexMap::new();
        obj.insert("a".to_string(), Wire::Number(1.0));
        let w = Wire::Object(obj);
        let s = serde_json::to_string(&w).unwrap();
        let back: Wire = serde_json::from_str(&s).unwrap();
        assert_eq!(back, w);
    }
}
