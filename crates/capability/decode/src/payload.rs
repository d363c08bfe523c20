//! payload 解析：结构化记录（value/units/quality…）或裸数值字符串。

use crate::DecodeError;
use serde_json::{Map, Value};

/// 结构化 payload（camelCase，兼容 snake_case 与常见别名）。
#[derive(Debug, Default)]
pub(crate) struct PayloadRecord {
    pub value: Option<Value>,
    pub units: Option<Value>,
    pub quality: Option<Value>,
    pub timestamp: Option<Value>,
    pub site_id: Option<Value>,
    pub equipment_type: Option<Value>,
    pub equipment_id: Option<Value>,
    pub device_id: Option<Value>,
    pub device_name: Option<Value>,
    pub device_ip: Option<Value>,
    pub object_type: Option<Value>,
    pub object_instance: Option<Value>,
    pub point_id: Option<Value>,
    pub point_name: Option<Value>,
    pub haystack_name: Option<Value>,
    pub dis: Option<Value>,
    pub poll_duration: Option<Value>,
    pub poll_cycle: Option<Value>,
}

impl PayloadRecord {
    /// 同一字段出现多个别名时按列出顺序取第一个非 null 的值。
    fn from_map(mut map: Map<String, Value>) -> Self {
        let mut pick = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| map.remove(*key).filter(|value| !value.is_null()))
        };
        Self {
            value: pick(&["value", "presentValue", "present_value"]),
            units: pick(&["units", "unit"]),
            quality: pick(&["quality"]),
            timestamp: pick(&["timestamp", "ts", "time", "tsMs", "ts_ms"]),
            site_id: pick(&["siteId", "site_id"]),
            equipment_type: pick(&["equipmentType", "equipment_type"]),
            equipment_id: pick(&["equipmentId", "equipment_id"]),
            device_id: pick(&["deviceId", "device_id"]),
            device_name: pick(&["deviceName", "device_name"]),
            device_ip: pick(&["deviceIp", "device_ip"]),
            object_type: pick(&["objectType", "object_type"]),
            object_instance: pick(&["objectInstance", "object_instance"]),
            point_id: pick(&["pointId", "point_id"]),
            point_name: pick(&["pointName", "point_name"]),
            haystack_name: pick(&["haystackName", "haystack_name"]),
            dis: pick(&["dis", "displayName", "display_name"]),
            poll_duration: pick(&["pollDuration", "poll_duration"]),
            poll_cycle: pick(&["pollCycle", "poll_cycle"]),
        }
    }
}

/// 解析后的 payload。
#[derive(Debug)]
pub(crate) enum ParsedPayload {
    /// 裸数值（文本数值、JSON 数值或 JSON 数值字符串）。
    Bare(f64),
    Record(f64, Box<PayloadRecord>),
}

pub(crate) fn parse_payload(payload: &[u8]) -> Result<ParsedPayload, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidEncoding)?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    // 纯文本数值，例如 `21.5`
    if !trimmed.starts_with('{') && !trimmed.starts_with('"') && !trimmed.starts_with('[') {
        return parse_number_text(trimmed).map(ParsedPayload::Bare);
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|err| DecodeError::InvalidPayload(err.to_string()))?;
    match value {
        Value::String(text) => parse_number_text(text.trim()).map(ParsedPayload::Bare),
        Value::Object(map) => {
            let record = PayloadRecord::from_map(map);
            let number = match record.value.as_ref() {
                None => return Err(DecodeError::MissingValue),
                Some(value) => numeric_value(value)?,
            };
            Ok(ParsedPayload::Record(number, Box::new(record)))
        }
        other => Err(DecodeError::InvalidPayload(format!(
            "unsupported payload type: {}",
            json_type(&other)
        ))),
    }
}

fn parse_number_text(text: &str) -> Result<f64, DecodeError> {
    let number = text
        .parse::<f64>()
        .map_err(|_| DecodeError::NotNumeric(truncate(text)))?;
    finite(number)
}

/// value 字段：数值、数值字符串或布尔（1.0 / 0.0）。
fn numeric_value(value: &Value) -> Result<f64, DecodeError> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| DecodeError::NotNumeric(number.to_string()))
            .and_then(finite),
        Value::String(text) => parse_number_text(text.trim()),
        Value::Bool(flag) => Ok(if *flag { 1.0 } else { 0.0 }),
        other => Err(DecodeError::NotNumeric(truncate(&other.to_string()))),
    }
}

fn finite(number: f64) -> Result<f64, DecodeError> {
    if number.is_finite() {
        Ok(number)
    } else {
        Err(DecodeError::NonFinite)
    }
}

/// 宽松取字符串：字符串原样，数值/布尔转文本，空串视为缺省。
pub(crate) fn as_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => return None,
    };
    if text.is_empty() { None } else { Some(text) }
}

/// 宽松取整数：整数、可截断的浮点数或数值字符串。
pub(crate) fn as_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.is_finite()).map(|v| v as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub(crate) fn as_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64().filter(|v| v.is_finite()),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// payload 时间戳：RFC 3339 字符串（`Z` 或偏移量）、无时区 ISO 8601（按 UTC）或毫秒时间戳。
pub(crate) fn parse_timestamp_ms(value: Option<&Value>) -> Result<Option<i64>, DecodeError> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))
            .map(Some)
            .ok_or_else(|| DecodeError::InvalidTimestamp(number.to_string())),
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(text) {
                return Ok(Some(parsed.timestamp_millis()));
            }
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|naive| Some(naive.and_utc().timestamp_millis()))
                .map_err(|_| DecodeError::InvalidTimestamp(truncate(text)))
        }
        other => Err(DecodeError::InvalidTimestamp(truncate(&other.to_string()))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate(text: &str) -> String {
    const MAX: usize = 64;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
