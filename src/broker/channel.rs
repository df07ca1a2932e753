//! 频道命名与主题匹配
//!
//! 频道按会话分区：`conversation.<id>.inbound` / `.response` / `.tasks`，
//! Agent 请求频道 `agent.<name>.request`。订阅支持 AMQP 风格通配：
//! `*` 匹配一个段，`#` 匹配零个或多个段。
//!
//! ID 作为单个频道段写入：`%`、`.`、`*`、`#` 按 `%XX` 转义，任意 ID 都能安全往返。

use std::borrow::Cow;

use crate::core::BrokerError;

const CONVERSATION_PREFIX: &str = "conversation.";

/// 所有会话的入站频道
pub const ALL_INBOUND: &str = "conversation.*.inbound";
/// 所有会话的回复频道
pub const ALL_RESPONSES: &str = "conversation.*.response";
/// 所有会话的任务事件频道
pub const ALL_TASK_EVENTS: &str = "conversation.*.tasks";

fn is_reserved(c: char) -> bool {
    matches!(c, '%' | '.' | '*' | '#')
}

/// 把 ID 编码为单个频道段
pub fn encode_segment(id: &str) -> Cow<'_, str> {
    if !id.contains(is_reserved) {
        return Cow::Borrowed(id);
    }
    let mut out = String::with_capacity(id.len() + 8);
    for c in id.chars() {
        match c {
            '%' => out.push_str("%25"),
            '.' => out.push_str("%2E"),
            '*' => out.push_str("%2A"),
            '#' => out.push_str("%23"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// encode_segment 的逆操作；遇到无法识别的转义返回 None
pub fn decode_segment(segment: &str) -> Option<String> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        out.push(match code.as_str() {
            "25" => '%',
            "2E" => '.',
            "2A" => '*',
            "23" => '#',
            _ => return None,
        });
    }
    Some(out)
}

pub fn inbound(conversation_id: &str) -> String {
    format!("{CONVERSATION_PREFIX}{}.inbound", encode_segment(conversation_id))
}

pub fn response(conversation_id: &str) -> String {
    format!("{CONVERSATION_PREFIX}{}.response", encode_segment(conversation_id))
}

pub fn task_events(conversation_id: &str) -> String {
    format!("{CONVERSATION_PREFIX}{}.tasks", encode_segment(conversation_id))
}

pub fn agent_request(agent_name: &str) -> String {
    format!("agent.{}.request", encode_segment(agent_name))
}

/// 从会话频道名中取出（解码后的）会话 ID
pub fn conversation_of(channel: &str) -> Option<String> {
    let rest = channel.strip_prefix(CONVERSATION_PREFIX)?;
    let (id, _kind) = rest.rsplit_once('.')?;
    if id.is_empty() || id.contains('.') {
        None
    } else {
        decode_segment(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`
    One,
    /// `#`
    Any,
}

/// 订阅主题模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl ChannelPattern {
    pub fn parse(pattern: &str) -> Result<Self, BrokerError> {
        if pattern.is_empty() {
            return Err(BrokerError::InvalidPattern("empty pattern".to_string()));
        }
        let segments = pattern
            .split('.')
            .map(|s| match s {
                "" => Err(BrokerError::InvalidPattern(format!("empty segment in '{pattern}'"))),
                "*" => Ok(Segment::One),
                "#" => Ok(Segment::Any),
                s if s.contains('*') || s.contains('#') => Err(BrokerError::InvalidPattern(
                    format!("partial wildcard '{s}' in '{pattern}'"),
                )),
                s => Ok(Segment::Literal(s.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// 不含通配符，可用于发布
    pub fn is_concrete(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, channel: &str) -> bool {
        let parts: Vec<&str> = channel.split('.').collect();
        match_segments(&self.segments, &parts)
    }
}

fn match_segments(pattern: &[Segment], channel: &[&str]) -> bool {
    match pattern.split_first() {
        None => channel.is_empty(),
        Some((Segment::Any, rest)) => (0..=channel.len()).any(|i| match_segments(rest, &channel[i..])),
        Some((Segment::One, rest)) => !channel.is_empty() && match_segments(rest, &channel[1..]),
        Some((Segment::Literal(lit), rest)) => {
            channel.first().map(|c| *c == lit).unwrap_or(false) && match_segments(rest, &channel[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(inbound("c1"), "conversation.c1.inbound");
        assert_eq!(response("c1"), "conversation.c1.response");
        assert_eq!(agent_request("weather"), "agent.weather.request");
        assert_eq!(conversation_of("conversation.c1.response").as_deref(), Some("c1"));
        assert_eq!(conversation_of("agent.weather.request"), None);
    }

    #[test]
    fn test_reserved_characters_in_ids_stay_one_segment() {
        let star = ChannelPattern::parse(ALL_INBOUND).unwrap();
        for id in ["user.42", "a*b", "#general", "100%", "%2E", "plain"] {
            let channel = inbound(id);
            assert!(star.matches(&channel), "{channel}");
            assert!(ChannelPattern::parse(&channel).unwrap().is_concrete(), "{channel}");
            assert_eq!(conversation_of(&channel).as_deref(), Some(id));
        }
        assert_eq!(inbound("user.42"), "conversation.user%2E42.inbound");
        assert_eq!(decode_segment("bad%zz"), None);
    }

    #[test]
    fn test_wildcards() {
        let star = ChannelPattern::parse(ALL_INBOUND).unwrap();
        assert!(star.matches("conversation.c1.inbound"));
        assert!(!star.matches("conversation.c1.response"));
        assert!(!star.matches("conversation.inbound"));

        let hash = ChannelPattern::parse("conversation.#").unwrap();
        assert!(hash.matches("conversation"));
        assert!(hash.matches("conversation.c1.tasks"));
        assert!(!hash.matches("agent.x.request"));

        assert!(ChannelPattern::parse("agent.weather.request").unwrap().is_concrete());
        assert!(!star.is_concrete());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(ChannelPattern::parse("").is_err());
        assert!(ChannelPattern::parse("a..b").is_err());
        assert!(ChannelPattern::parse("agent.we*").is_err());
    }
}
