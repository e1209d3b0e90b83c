use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

// 时间工具函数
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// ISO 8601，毫秒精度，`Z` 结尾
pub fn iso_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 每个进程实例唯一的客户端 ID，避免多实例共用 broker 时互相踢下线
pub fn generate_client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &suffix[..12])
}

/// 解析 `mqtts://host:port` 形式的 broker 地址，返回主机名和可选端口
pub fn split_broker_url(raw: &str) -> (String, Option<u16>) {
    let without_scheme = raw
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(raw);
    let authority = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme);

    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (authority.to_string(), None),
        },
        None => (authority.to_string(), None),
    }
}

// 字符串工具函数
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
