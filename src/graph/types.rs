//! Shared graph value types used across the materializer, layout engine,
//! community detector, bundle computer, and query layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const ZERO: Point3 = Point3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn distance(&self, other: &Point3) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub val: f64,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos_z: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphLink {
    pub id: i64,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphPayload {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Encodes a `(weight, id)` pagination cursor as base64 of `"weight:id"`
/// (§6.4). Weight is formatted with enough precision to round-trip.
pub fn encode_cursor(weight: f64, id: &str) -> String {
    use base64::Engine;
    let raw = format!("{weight}:{id}");
    base64::engine::general_purpose::STANDARD.encode(raw)
}

pub fn decode_cursor(cursor: &str) -> Option<(f64, String)> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD.decode(cursor).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let (weight, id) = raw.split_once(':')?;
    Some((weight.parse().ok()?, id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let encoded = encode_cursor(42.5, "user_7");
        let (weight, id) = decode_cursor(&encoded).unwrap();
        assert_eq!(weight, 42.5);
        assert_eq!(id, "user_7");
    }
}
