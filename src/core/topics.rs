//! Topic layout for a device session.
//!
//! Every command exists twice: broadcast (`<base>/brightness`) and scoped to one
//! device (`<base>/<serial>/brightness`). Dispatch matches on the topic suffix,
//! so both forms route to the same handler.

/// Command addressed to a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Brightness,
    Sleep,
    Wake,
    ReplaceConfig,
    ReplaceKey(usize),
}

const COMMAND_SUFFIXES: [&str; 5] = ["brightness", "sleep", "wake", "config", "config/+"];

fn has_segment_suffix(topic: &str, suffix: &str) -> bool {
    topic == suffix
        || topic
            .strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('/'))
}

impl Command {
    /// Maps a full inbound topic to a command.
    ///
    /// Checked in order: brightness, sleep, wake, config, `config/<i>`. Key
    /// indices outside `0..key_count` and unknown topics give `None`.
    pub fn parse(topic: &str, key_count: usize) -> Option<Command> {
        if has_segment_suffix(topic, "brightness") {
            return Some(Command::Brightness);
        }
        if has_segment_suffix(topic, "sleep") {
            return Some(Command::Sleep);
        }
        if has_segment_suffix(topic, "wake") {
            return Some(Command::Wake);
        }
        if has_segment_suffix(topic, "config") {
            return Some(Command::ReplaceConfig);
        }

        let (head, index) = topic.rsplit_once('/')?;
        if !has_segment_suffix(head, "config") {
            return None;
        }
        let index: usize = index.parse().ok()?;
        (index < key_count).then_some(Command::ReplaceKey(index))
    }
}

/// Subscriptions for a session, relative to the base topic.
pub fn subscriptions(serial: &str) -> Vec<String> {
    COMMAND_SUFFIXES
        .iter()
        .flat_map(|suffix| [suffix.to_string(), format!("{serial}/{suffix}")])
        .collect()
}

/// Published when `key` goes down.
pub fn press_topics(serial: &str, key: usize) -> Vec<String> {
    vec![format!("{key}/down"), format!("{serial}/{key}/down")]
}

/// Published when `key` comes back up: the click topics, then the transition.
pub fn release_topics(serial: &str, key: usize) -> Vec<String> {
    vec![
        format!("{key}"),
        format!("{serial}/{key}"),
        format!("{key}/up"),
        format!("{serial}/{key}/up"),
    ]
}

/// Availability topic carrying `online` / `offline`.
pub fn status_topic(serial: &str) -> String {
    format!("{serial}/status")
}
