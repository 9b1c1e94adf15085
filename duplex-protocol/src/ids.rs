use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// Which side of the boundary originated an id. Ids are local to the
/// originating side (spec.md §4.1, "Guest/Host partitioning"); the tag is
/// carried into the wire string so a peer can tell at a glance whether a
/// release needs to be routed back across the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Guest,
    Host,
}

impl Side {
    fn tag(self) -> &'static str {
        match self {
            Side::Guest => "g",
            Side::Host => "h",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Dense positive node id assigned by the producer. `0` is reserved for the
/// root container (spec.md §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(v: u32) -> Self {
        NodeId(v)
    }
}

/// Monotonically increasing id, one counter per Bridge instance (spec.md §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense arena id for a registered callback, rendered as an opaque string
/// only at the wire boundary (spec.md §9, "Registries as arena + dense ids").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FnId {
    side: Side,
    n: u64,
}

impl FnId {
    pub fn new(side: Side, n: u64) -> Self {
        FnId { side, n }
    }

    pub fn side(self) -> Side {
        self.side
    }

    pub fn inner(self) -> u64 {
        self.n
    }
}

impl fmt::Display for FnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_fn{}", self.side, self.n)
    }
}

impl FromStr for FnId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (side_tag, rest) = s.split_once('_').ok_or_else(|| format!("bad fnId {s}"))?;
        let side = match side_tag {
            "g" => Side::Guest,
            "h" => Side::Host,
            _ => return Err(format!("bad fnId side {s}")),
        };
        let n = rest
            .strip_prefix("fn")
            .ok_or_else(|| format!("bad fnId {s}"))?
            .parse::<u64>()
            .map_err(|e| format!("bad fnId {s}: {e}"))?;
        Ok(FnId { side, n })
    }
}

impl Serialize for FnId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FnId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        FnId::from_str(&s).map_err(DeError::custom)
    }
}

/// Opaque id for an in-flight promise, unique per `PromiseManager` instance,
/// rendered `p_<n>` (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(u64);

impl PromiseId {
    pub fn new(n: u64) -> Self {
        PromiseId(n)
    }

    pub fn inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p_{}", self.0)
    }
}

impl FromStr for PromiseId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("p_")
            .ok_or_else(|| format!("bad promiseId {s}"))?
            .parse::<u64>()
            .map(PromiseId)
            .map_err(|e| format!("bad promiseId {s}: {e}"))
    }
}

impl Serialize for PromiseId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PromiseId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        PromiseId::from_str(&s).map_err(DeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_id_round_trips_through_its_wire_string() {
        let id = FnId::new(Side::Guest, 42);
        let s = id.to_string();
        assert_eq!(s, "g_fn42");
        assert_eq!(s.parse::<FnId>().unwrap(), id);
    }

    #[test]
    fn promise_id_round_trips_through_its_wire_string() {
        let id = PromiseId::new(7);
        assert_eq!(id.to_string(), "p_7");
        assert_eq!("p_7".parse::<PromiseId>().unwrap(), id);
    }

    #[test]
    fn node_zero_is_root() {
        assert!(NodeId::ROOT.is_root());
        assert!(!NodeId(1).is_root());
    }
}
