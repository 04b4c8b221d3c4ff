//! Affected subway stops of an event, one output row per stop
//!
//! Event feeds list affected stops as a JSON array of `[name, lines]` pairs.
//! Each pair becomes a row; with a [`StopDirectory`] the stop name is then
//! mapped to its directional GTFS stop ids (`A02N`, `A02S`), one row each.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrolake_core::{Record, Value};
use serde::{Deserialize, Serialize};

/// Stop name → GTFS stop ids, loaded from a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StopDirectory {
    by_name: BTreeMap<String, Vec<String>>,
}

impl StopDirectory {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn insert(&mut self, name: &str, ids: &[&str]) {
        self.by_name
            .insert(name.to_string(), ids.iter().map(|s| s.to_string()).collect());
    }

    pub fn stop_ids(&self, name: &str) -> &[String] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Only platform-level ids carry a direction suffix.
fn is_directional(stop_id: &str) -> bool {
    stop_id.ends_with('N') || stop_id.ends_with('S')
}

/// Which fields hold the stop list and receive the exploded values.
#[derive(Debug, Clone, PartialEq)]
pub struct StopExplode {
    pub source: String,
    pub name_field: String,
    pub lines_field: String,
    pub id_field: String,
    pub directory: Option<Arc<StopDirectory>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Exploded {
    pub records: Vec<Record>,
    /// Events whose stop list was missing or empty.
    pub without_stops: usize,
    /// Stops dropped because the directory had no directional id for them.
    pub unmapped: usize,
}

/// `[name, lines]` pairs out of the stop-list column. Anything that is not
/// an array of at-least-two-element arrays yields nothing.
pub fn affected_stops(value: Option<&Value>) -> Vec<(String, String)> {
    let Some(text) = value.and_then(Value::as_str) else {
        return Vec::new();
    };
    let Ok(serde_json::Value::Array(items)) = serde_json::from_str(text) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item.as_array() {
            Some(pair) if pair.len() >= 2 => Some((plain_text(&pair[0]), plain_text(&pair[1]))),
            _ => None,
        })
        .collect()
}

fn plain_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl StopExplode {
    pub fn new(source: &str, name_field: &str, lines_field: &str, id_field: &str) -> Self {
        Self {
            source: source.to_string(),
            name_field: name_field.to_string(),
            lines_field: lines_field.to_string(),
            id_field: id_field.to_string(),
            directory: None,
        }
    }

    /// Key of an exploded row: the event key plus the stop it refers to.
    pub fn row_key(&self, natural_key: &[String]) -> Vec<String> {
        let mut key = natural_key.to_vec();
        match self.directory {
            Some(_) => key.push(self.id_field.clone()),
            None => key.push(self.name_field.clone()),
        }
        key
    }

    pub fn explode(&self, records: Vec<Record>) -> Exploded {
        let mut out = Exploded::default();
        for mut record in records {
            let stops = affected_stops(record.get(&self.source));
            if stops.is_empty() {
                out.without_stops += 1;
                continue;
            }
            record.remove(&self.source);
            for (name, lines) in stops {
                let mut row = record.clone();
                row.set(&self.name_field, name.as_str());
                row.set(&self.lines_field, lines);
                let Some(directory) = &self.directory else {
                    out.records.push(row);
                    continue;
                };
                let ids: Vec<&String> = directory
                    .stop_ids(&name)
                    .iter()
                    .filter(|id| is_directional(id))
                    .collect();
                if ids.is_empty() {
                    out.unmapped += 1;
                }
                for id in ids {
                    out.records.push(row.clone().with(&self.id_field, id.as_str()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(name: &str, stops: Option<&str>) -> Record {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap();
        let r = Record::new(ts, ts).with("nombre_evento", name);
        match stops {
            Some(s) => r.with("paradas_afectadas", s),
            None => r,
        }
    }

    fn explode_rule() -> StopExplode {
        StopExplode::new("paradas_afectadas", "parada_nombre", "parada_lineas", "stop_id")
    }

    fn directory() -> Arc<StopDirectory> {
        let mut d = StopDirectory::default();
        d.insert("Times Sq-42 St", &["127", "127N", "127S"]);
        d.insert("161 St-Yankee Stadium", &["414N", "414S", "D11N", "D11S"]);
        Arc::new(d)
    }

    #[test]
    fn pairs_parsed_leniently() {
        let v = Value::from(r#"[["Times Sq-42 St", "1 2 3"], ["lonely"], [7, ["A"]]]"#);
        assert_eq!(
            affected_stops(Some(&v)),
            [
                ("Times Sq-42 St".to_string(), "1 2 3".to_string()),
                ("7".to_string(), r#"["A"]"#.to_string()),
            ]
        );
        assert!(affected_stops(Some(&Value::from("not json"))).is_empty());
        assert!(affected_stops(Some(&Value::Int(3))).is_empty());
        assert!(affected_stops(None).is_empty());
    }

    #[test]
    fn events_without_stops_are_dropped() {
        let out = explode_rule().explode(vec![
            event("Street Fair", None),
            event("Parade", Some("[]")),
            event("Concert", Some(r#"[["Times Sq-42 St", "1 2 3"]]"#)),
        ]);
        assert_eq!(out.without_stops, 2);
        assert_eq!(out.records.len(), 1);
        let r = &out.records[0];
        assert_eq!(r.get("parada_nombre"), Some(&Value::from("Times Sq-42 St")));
        assert_eq!(r.get("parada_lineas"), Some(&Value::from("1 2 3")));
        assert_eq!(r.get("paradas_afectadas"), None);
        assert_eq!(r.get("stop_id"), None);
    }

    #[test]
    fn directory_maps_to_directional_ids() {
        let mut rule = explode_rule();
        rule.directory = Some(directory());
        let out = rule.explode(vec![event(
            "Yankees vs Red Sox",
            Some(r#"[["161 St-Yankee Stadium", "4 B D"], ["Times Sq-42 St", "1"], ["Nowhere", "Z"]]"#),
        )]);
        let ids: Vec<_> = out.records.iter().filter_map(|r| r.get("stop_id").cloned()).collect();
        assert_eq!(
            ids,
            ["414N", "414S", "D11N", "D11S", "127N", "127S"].map(Value::from)
        );
        assert_eq!(out.unmapped, 1);
        assert_eq!(rule.row_key(&["nombre_evento".into()]), ["nombre_evento", "stop_id"]);
    }

    #[test]
    fn directory_loads_from_json() {
        let d = StopDirectory::from_json(r#"{"Canal St": ["A32N", "A32S"]}"#).unwrap();
        assert_eq!(d.stop_ids("Canal St"), ["A32N", "A32S"]);
        assert!(d.stop_ids("Bowling Green").is_empty());
        assert_eq!(d.len(), 1);
        assert!(StopDirectory::from_json("[1, 2]").is_err());
    }
}
