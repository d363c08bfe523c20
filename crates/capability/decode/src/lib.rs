//! MQTT 消息解码：topic + payload → Reading。
//!
//! 纯函数、无状态：同样的输入（到达时间除外）总是得到同样的 Reading，
//! 写入重试依赖这一点保证幂等。

mod payload;
mod topic;

pub use topic::{SchemaError, SegmentRole, TopicFields, TopicSchema};

use domain::{RawEvent, Reading};
use payload::{ParsedPayload, as_f64, as_i64, as_text, parse_payload, parse_timestamp_ms};

/// 解码错误：计数并记录日志，消息丢弃，不影响连接。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    EmptyPayload,
    #[error("payload is not valid utf-8")]
    InvalidEncoding,
    #[error("payload is not numeric: {0}")]
    NotNumeric(String),
    #[error("payload has no value field")]
    MissingValue,
    #[error("value is not finite")]
    NonFinite,
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("topic does not map to a point: {0}")]
    UnmappedTopic(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl DecodeError {
    /// 日志中的错误类别。
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::EmptyPayload => "empty_payload",
            DecodeError::InvalidEncoding => "invalid_encoding",
            DecodeError::NotNumeric(_) => "not_numeric",
            DecodeError::MissingValue => "missing_value",
            DecodeError::NonFinite => "non_finite",
            DecodeError::InvalidTimestamp(_) => "invalid_timestamp",
            DecodeError::UnmappedTopic(_) => "unmapped_topic",
            DecodeError::InvalidPayload(_) => "invalid_payload",
        }
    }
}

/// 解码器。
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    schema: TopicSchema,
}

impl Decoder {
    pub fn new(schema: TopicSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &TopicSchema {
        &self.schema
    }

    pub fn decode_event(&self, event: &RawEvent) -> Result<Reading, DecodeError> {
        self.decode(&event.topic, &event.payload, event.received_at_ms)
    }

    /// 解码一条消息。
    ///
    /// topic 映射的字段优先，payload 中的同名字段只补缺。
    pub fn decode(
        &self,
        topic: &str,
        payload: &[u8],
        arrival_ms: i64,
    ) -> Result<Reading, DecodeError> {
        let fields = self.schema.map(topic);
        let parsed = parse_payload(payload)?;

        let (value, record) = match parsed {
            ParsedPayload::Bare(value) => (value, None),
            ParsedPayload::Record(value, record) => (value, Some(record)),
        };

        let Some(record) = record else {
            let point_name = fields
                .point_name
                .clone()
                .ok_or_else(|| DecodeError::UnmappedTopic(topic.to_string()))?;
            let mut reading = Reading::new(arrival_ms, point_name, value);
            apply_topic_fields(&mut reading, &fields);
            return Ok(reading);
        };

        let point_name = fields
            .point_name
            .clone()
            .or_else(|| as_text(record.point_name.as_ref()))
            .or_else(|| as_text(record.haystack_name.as_ref()))
            .ok_or_else(|| DecodeError::UnmappedTopic(topic.to_string()))?;
        let ts_ms = parse_timestamp_ms(record.timestamp.as_ref())?.unwrap_or(arrival_ms);

        let mut reading = Reading::new(ts_ms, point_name, value);
        apply_topic_fields(&mut reading, &fields);

        reading.display_name = as_text(record.dis.as_ref());
        reading.units = as_text(record.units.as_ref()).unwrap_or_default();
        if let Some(quality) = as_text(record.quality.as_ref()) {
            reading.quality = quality;
        }
        reading.device_id = as_i64(record.device_id.as_ref()).unwrap_or(0);
        if reading.device_name.is_empty() {
            reading.device_name = as_text(record.device_name.as_ref()).unwrap_or_default();
        }
        reading.device_ip = as_text(record.device_ip.as_ref()).unwrap_or_default();
        reading.object_type = as_text(record.object_type.as_ref()).unwrap_or_default();
        reading.object_instance = as_i64(record.object_instance.as_ref()).unwrap_or(0);
        reading.site_id = reading
            .site_id
            .take()
            .or_else(|| as_text(record.site_id.as_ref()));
        reading.equipment_type = reading
            .equipment_type
            .take()
            .or_else(|| as_text(record.equipment_type.as_ref()));
        reading.equipment_id = reading
            .equipment_id
            .take()
            .or_else(|| as_text(record.equipment_id.as_ref()));
        reading.point_id = as_i64(record.point_id.as_ref());
        reading.haystack_name = as_text(record.haystack_name.as_ref());
        reading.poll_duration = as_f64(record.poll_duration.as_ref());
        reading.poll_cycle = as_i64(record.poll_cycle.as_ref());
        Ok(reading)
    }
}

fn apply_topic_fields(reading: &mut Reading, fields: &TopicFields<'_>) {
    reading.site_id = fields.site_id.map(str::to_string);
    reading.equipment_type = fields.equipment_type.map(str::to_string);
    reading.equipment_id = fields.equipment_id.map(str::to_string);
    if let Some(device_name) = fields.device_name {
        reading.device_name = device_name.to_string();
    }
}
