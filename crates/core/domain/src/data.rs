/// 协议输入原始事件（一条 MQTT 消息）。
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at_ms: i64,
}

/// 解码后的一条遥测读数。
///
/// 解码后不再修改：要么整行写入时序库，要么被丢弃（并记录原因）。
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// 采集时间（payload 未携带时取消息到达时间）。
    pub ts_ms: i64,
    /// 由 topic 推导的点位名（未映射的段作为后缀保留）。
    pub point_name: String,
    /// Haystack `dis` 显示名。
    pub display_name: Option<String>,
    pub value: f64,
    pub units: String,
    pub quality: String,
    pub device_id: i64,
    pub device_name: String,
    pub device_ip: String,
    pub object_type: String,
    pub object_instance: i64,
    pub site_id: Option<String>,
    pub equipment_type: Option<String>,
    pub equipment_id: Option<String>,
    pub point_id: Option<i64>,
    pub haystack_name: Option<String>,
    pub poll_duration: Option<f64>,
    pub poll_cycle: Option<i64>,
}

impl Reading {
    /// 默认质量标记。
    pub const DEFAULT_QUALITY: &'static str = "good";

    /// 构造只含必填字段的读数，其余字段取默认值。
    pub fn new(ts_ms: i64, point_name: impl Into<String>, value: f64) -> Self {
        Self {
            ts_ms,
            point_name: point_name.into(),
            display_name: None,
            value,
            units: String::new(),
            quality: Self::DEFAULT_QUALITY.to_string(),
            device_id: 0,
            device_name: String::new(),
            device_ip: String::new(),
            object_type: String::new(),
            object_instance: 0,
            site_id: None,
            equipment_type: None,
            equipment_id: None,
            point_id: None,
            haystack_name: None,
            poll_duration: None,
            poll_cycle: None,
        }
    }

    /// 存储层去重键：(time, point_name, device_id)。
    pub fn natural_key(&self) -> (i64, &str, i64) {
        (self.ts_ms, self.point_name.as_str(), self.device_id)
    }
}
