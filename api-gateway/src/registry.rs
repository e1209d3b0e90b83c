use homelink_shared::{ServoMode, TopicConfig, TopicFilter};

// 支持的设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Fan,
    RoomLight,
    ReadingLamp,
    Door,
    Curtain,
}

impl DeviceKind {
    /// 日志和错误信息里使用的名称
    pub fn display_name(&self) -> &'static str {
        match self {
            DeviceKind::Fan => "fan",
            DeviceKind::RoomLight => "room light",
            DeviceKind::ReadingLamp => "reading lamp",
            DeviceKind::Door => "door servo",
            DeviceKind::Curtain => "curtain servo",
        }
    }
}

/// 设备负载格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// `{"state": bool}`
    Toggle,
    /// `{"command": "open" | "close"}`
    ServoCommand,
    /// `{"angle": 0..=180}`
    ServoAngle,
}

impl PayloadShape {
    /// REST 请求体中携带动作的字段
    pub fn param_name(&self) -> &'static str {
        match self {
            PayloadShape::Toggle => "state",
            PayloadShape::ServoCommand => "command",
            PayloadShape::ServoAngle => "angle",
        }
    }

    pub fn is_servo(&self) -> bool {
        !matches!(self, PayloadShape::Toggle)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub kind: DeviceKind,
    pub aliases: &'static [&'static str],
    pub topic: String,
    pub shape: PayloadShape,
}

impl DeviceEntry {
    pub fn matches(&self, name: &str) -> bool {
        self.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(name))
    }
}

/// 固定的设备表，舵机格式在启动时由 `servo_mode` 决定
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    entries: Vec<DeviceEntry>,
    servo_mode: ServoMode,
}

impl DeviceRegistry {
    pub fn new(topics: &TopicConfig, servo_mode: ServoMode) -> Self {
        let servo_shape = match servo_mode {
            ServoMode::Command => PayloadShape::ServoCommand,
            ServoMode::Angle => PayloadShape::ServoAngle,
        };

        let mut entries = vec![
            DeviceEntry {
                kind: DeviceKind::Fan,
                aliases: &["fan"],
                topic: topics.fan.clone(),
                shape: PayloadShape::Toggle,
            },
            DeviceEntry {
                kind: DeviceKind::Door,
                aliases: &["door", "door servo"],
                topic: topics.door_servo.clone(),
                shape: servo_shape,
            },
            DeviceEntry {
                kind: DeviceKind::Curtain,
                aliases: &["curtain", "curtains", "curtain servo"],
                topic: topics.curtain_servo.clone(),
                shape: servo_shape,
            },
        ];

        // 角度模式的部署没有灯光设备
        if servo_mode == ServoMode::Command {
            entries.push(DeviceEntry {
                kind: DeviceKind::RoomLight,
                aliases: &["room light", "room"],
                topic: topics.room_light.clone(),
                shape: PayloadShape::Toggle,
            });
            entries.push(DeviceEntry {
                kind: DeviceKind::ReadingLamp,
                aliases: &["reading lamp", "reading light", "reading", "lamp"],
                topic: topics.reading_lamp.clone(),
                shape: PayloadShape::Toggle,
            });
        }

        Self { entries, servo_mode }
    }

    /// 按名称或别名查找，不区分大小写
    pub fn resolve(&self, name: &str) -> Option<&DeviceEntry> {
        let name = name.trim();
        self.entries.iter().find(|entry| entry.matches(name))
    }

    pub fn entries(&self) -> &[DeviceEntry] {
        &self.entries
    }

    pub fn servo_mode(&self) -> ServoMode {
        self.servo_mode
    }

    /// 设备主题加状态主题
    pub fn subscriptions(&self, status_topic: &str) -> Vec<TopicFilter> {
        let mut filters: Vec<TopicFilter> = self
            .entries
            .iter()
            .map(|entry| TopicFilter::at_least_once(&entry.topic))
            .collect();
        filters.push(TopicFilter::at_least_once(status_topic));
        filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> TopicConfig {
        TopicConfig {
            fan: "home/fan".to_string(),
            door_servo: "home/servo/door".to_string(),
            curtain_servo: "home/servo/curtain".to_string(),
            room_light: "home/light/room".to_string(),
            reading_lamp: "home/light/reading".to_string(),
            status: "home/status".to_string(),
        }
    }

    #[test]
    fn test_resolve_aliases_case_insensitive() {
        let registry = DeviceRegistry::new(&topics(), ServoMode::Command);

        assert_eq!(registry.resolve("Room Light").unwrap().kind, DeviceKind::RoomLight);
        assert_eq!(registry.resolve("room").unwrap().kind, DeviceKind::RoomLight);
        assert_eq!(registry.resolve("LAMP").unwrap().kind, DeviceKind::ReadingLamp);
        assert_eq!(registry.resolve(" fan ").unwrap().kind, DeviceKind::Fan);
        assert_eq!(registry.resolve("curtain").unwrap().topic, "home/servo/curtain");
        assert!(registry.resolve("toaster").is_none());
    }

    #[test]
    fn test_command_profile_shapes() {
        let registry = DeviceRegistry::new(&topics(), ServoMode::Command);

        assert_eq!(registry.resolve("door").unwrap().shape, PayloadShape::ServoCommand);
        assert_eq!(registry.resolve("fan").unwrap().shape, PayloadShape::Toggle);
        assert_eq!(registry.entries().len(), 5);
    }

    #[test]
    fn test_angle_profile_has_no_lights() {
        let registry = DeviceRegistry::new(&topics(), ServoMode::Angle);

        assert_eq!(registry.resolve("curtain").unwrap().shape, PayloadShape::ServoAngle);
        assert!(registry.resolve("room light").is_none());
        assert!(registry.resolve("reading lamp").is_none());
        assert_eq!(registry.servo_mode(), ServoMode::Angle);
    }

    #[test]
    fn test_subscriptions_include_status_topic() {
        let registry = DeviceRegistry::new(&topics(), ServoMode::Command);
        let topics: Vec<String> = registry
            .subscriptions("home/status")
            .into_iter()
            .map(|filter| filter.topic_pattern)
            .collect();

        assert_eq!(topics.len(), 6);
        assert!(topics.contains(&"home/fan".to_string()));
        assert_eq!(topics.last().unwrap(), "home/status");
    }
}
