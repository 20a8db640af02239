//! Server statistics keyed by stat name, one slot per server in pool order.
//!
//! A slot is `None` when that server did not report the stat, so index `i`
//! always refers to the `i`-th server of the pool.

use std::collections::BTreeMap;
use std::fmt;

/// A single stat value as reported by one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatValue {
    /// Unsigned integral stats such as `pid` or `curr_items`.
    Number(u64),
    /// Everything else, e.g. `version` or `rusage_user`.
    Text(String),
}

impl StatValue {
    pub(crate) fn parse(raw: String) -> Self {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(value) = raw.parse() {
                return StatValue::Number(value);
            }
        }
        StatValue::Text(raw)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            StatValue::Number(value) => Some(*value),
            StatValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StatValue::Number(_) => None,
            StatValue::Text(text) => Some(text),
        }
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Number(value) => write!(f, "{value}"),
            StatValue::Text(text) => f.write_str(text),
        }
    }
}

/// Stats gathered from every server of a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    entries: BTreeMap<String, Vec<Option<StatValue>>>,
    servers: usize,
}

impl Stats {
    /// Merges per-server `(name, value)` lists, indexed by server position.
    pub(crate) fn from_servers(per_server: Vec<Vec<(String, String)>>) -> Self {
        let servers = per_server.len();
        let mut entries: BTreeMap<String, Vec<Option<StatValue>>> = BTreeMap::new();
        for (index, reported) in per_server.into_iter().enumerate() {
            for (name, value) in reported {
                let slots = entries.entry(name).or_insert_with(|| vec![None; servers]);
                slots[index] = Some(StatValue::parse(value));
            }
        }
        Stats { entries, servers }
    }

    /// Returns one slot per server for `name`; `None` where a server did not
    /// report it.
    pub fn get(&self, name: &str) -> Option<&[Option<StatValue>]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// Returns the value `server` (pool index) reported for `name`.
    pub fn value(&self, name: &str, server: usize) -> Option<&StatValue> {
        self.entries.get(name)?.get(server)?.as_ref()
    }

    /// Number of servers the stats were gathered from.
    pub fn server_count(&self) -> usize {
        self.servers
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Option<StatValue>])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
