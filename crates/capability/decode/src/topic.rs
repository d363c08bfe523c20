//! Topic 层级 → 分类字段映射。

use std::fmt;
use std::str::FromStr;

/// topic 中某一级的含义。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRole {
    Site,
    EquipmentType,
    EquipmentId,
    Device,
    Point,
    /// 占位（如固定前缀 `bacnet`），不映射到任何字段。
    Ignore,
}

impl SegmentRole {
    fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "site" | "site_id" => Some(SegmentRole::Site),
            "equipment_type" => Some(SegmentRole::EquipmentType),
            "equipment" | "equipment_id" => Some(SegmentRole::EquipmentId),
            "device" | "device_name" => Some(SegmentRole::Device),
            "point" | "point_name" => Some(SegmentRole::Point),
            "_" | "ignore" | "skip" => Some(SegmentRole::Ignore),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            SegmentRole::Site => "site",
            SegmentRole::EquipmentType => "equipment_type",
            SegmentRole::EquipmentId => "equipment_id",
            SegmentRole::Device => "device",
            SegmentRole::Point => "point",
            SegmentRole::Ignore => "_",
        }
    }
}

/// topic schema 解析错误。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("topic schema is empty")]
    Empty,
    #[error("unknown topic segment role: {0}")]
    UnknownRole(String),
    #[error("topic segment role used more than once: {0}")]
    DuplicateRole(String),
}

/// topic 层级 schema，例如 `site/equipment_id/device/point`。
///
/// 按位置映射；超出 schema 长度的层级作为点位名后缀保留。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSchema {
    roles: Vec<SegmentRole>,
}

impl Default for TopicSchema {
    fn default() -> Self {
        Self {
            roles: vec![
                SegmentRole::Site,
                SegmentRole::EquipmentId,
                SegmentRole::Device,
                SegmentRole::Point,
            ],
        }
    }
}

impl TopicSchema {
    pub fn new(roles: Vec<SegmentRole>) -> Result<Self, SchemaError> {
        if roles.is_empty() {
            return Err(SchemaError::Empty);
        }
        for (index, role) in roles.iter().enumerate() {
            if *role != SegmentRole::Ignore && roles[..index].contains(role) {
                return Err(SchemaError::DuplicateRole(role.as_str().to_string()));
            }
        }
        Ok(Self { roles })
    }

    pub fn roles(&self) -> &[SegmentRole] {
        &self.roles
    }

    /// 按 schema 拆分 topic。
    pub fn map<'a>(&self, topic: &'a str) -> TopicFields<'a> {
        let segments: Vec<&'a str> = topic
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();

        let mut fields = TopicFields::default();
        for (role, segment) in self.roles.iter().zip(segments.iter()) {
            match role {
                SegmentRole::Site => fields.site_id = Some(segment),
                SegmentRole::EquipmentType => fields.equipment_type = Some(segment),
                SegmentRole::EquipmentId => fields.equipment_id = Some(segment),
                SegmentRole::Device => fields.device_name = Some(segment),
                SegmentRole::Point => fields.point = Some(segment),
                SegmentRole::Ignore => {}
            }
        }

        let suffix = segments
            .get(self.roles.len()..)
            .map(|rest| rest.join("/"))
            .unwrap_or_default();
        fields.point_name = match (fields.point, suffix.is_empty()) {
            (Some(point), true) => Some(point.to_string()),
            (Some(point), false) => Some(format!("{}/{}", point, suffix)),
            (None, false) => Some(suffix),
            (None, true) => None,
        };
        fields
    }
}

impl FromStr for TopicSchema {
    type Err = SchemaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().trim_matches('/');
        if value.is_empty() {
            return Err(SchemaError::Empty);
        }
        let roles = value
            .split('/')
            .map(|token| {
                SegmentRole::parse(token).ok_or_else(|| SchemaError::UnknownRole(token.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(roles)
    }
}

impl fmt::Display for TopicSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<&str> = self.roles.iter().map(SegmentRole::as_str).collect();
        f.write_str(&rendered.join("/"))
    }
}

/// topic 映射结果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicFields<'a> {
    pub site_id: Option<&'a str>,
    pub equipment_type: Option<&'a str>,
    pub equipment_id: Option<&'a str>,
    pub device_name: Option<&'a str>,
    point: Option<&'a str>,
    /// point 段 + 未映射后缀。
    pub point_name: Option<String>,
}
