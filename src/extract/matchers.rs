//! Built-in chat matchers.
//!
//! Structured tags look like `[名称|field|field]`; a few features also have
//! a natural-language phrasing (`使用了金币`). When both phrasings of the same
//! event appear in one message they describe one event, so each matcher keeps
//! the larger of the two occurrence lists rather than the sum.

use std::collections::BTreeMap;

use regex::Regex;

use crate::entity::{
    is_placeholder, Candidate, ContactStatus, EntityKind, EnvelopeStatus, Observation,
    PointsDirection, Position, TaskStatus,
};
use crate::error::Result;
use crate::extract::{Extractor, ExtractorRegistry};
use crate::transcript::Transcript;

pub const TASKS_KEY: &str = "tasks";
pub const INVENTORY_KEY: &str = "inventory";
pub const CONTACTS_KEY: &str = "contacts";
pub const POINTS_KEY: &str = "points";
pub const RED_ENVELOPES_KEY: &str = "red_envelopes";
pub const AVATARS_KEY: &str = "avatars";

const NATURAL_POINTS_SOURCE: &str = "chat";

/// Register every built-in matcher under its pattern key.
pub fn register_builtin(registry: &mut ExtractorRegistry) -> Result<()> {
    registry.register(TASKS_KEY, TaskMatcher::new()?);
    registry.register(INVENTORY_KEY, InventoryMatcher::new()?);
    registry.register(CONTACTS_KEY, ContactMatcher::new()?);
    registry.register(POINTS_KEY, PointsMatcher::new()?);
    registry.register(RED_ENVELOPES_KEY, RedEnvelopeMatcher::new()?);
    registry.register(AVATARS_KEY, AvatarMatcher::new()?);
    Ok(())
}

/// A bracketed tag: `[name|field|field]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag<'a> {
    pub name: &'a str,
    pub fields: Vec<&'a str>,
}

impl<'a> Tag<'a> {
    fn field(&self, index: usize) -> Option<&'a str> {
        self.fields
            .get(index)
            .copied()
            .map(str::trim)
            .filter(|value| !is_placeholder(value))
    }
}

#[derive(Debug, Clone)]
pub struct TagParser {
    re: Regex,
}

impl TagParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            re: Regex::new(r"\[([^\[\]|]+)((?:\|[^\[\]|]*)*)\]")?,
        })
    }

    /// Every tag in `text`, in order of appearance.
    pub fn parse<'a>(&self, text: &'a str) -> Vec<Tag<'a>> {
        self.re
            .captures_iter(text)
            .filter_map(|caps| {
                let name = caps.get(1)?.as_str().trim();
                let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                let fields = if rest.is_empty() {
                    Vec::new()
                } else {
                    rest[1..].split('|').collect()
                };
                Some(Tag { name, fields })
            })
            .collect()
    }
}

fn parse_quantity(raw: Option<&str>) -> Option<i64> {
    match raw {
        None => Some(1),
        Some(value) => value.trim().parse::<i64>().ok().filter(|q| *q > 0),
    }
}

/// Per-message occurrence lists for one normalized event key, split by
/// phrasing.
#[derive(Debug, Default)]
struct Occurrences<T> {
    tagged: Vec<T>,
    natural: Vec<T>,
}

impl<T> Occurrences<T> {
    fn winner(self) -> Vec<T> {
        if self.natural.len() > self.tagged.len() {
            self.natural
        } else {
            self.tagged
        }
    }
}

// =============================================================================
// Tasks
// =============================================================================

pub struct TaskMatcher {
    tags: TagParser,
}

impl TaskMatcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tags: TagParser::new()?,
        })
    }
}

fn task_status_for(tag: &str) -> Option<TaskStatus> {
    match tag {
        "查看任务" | "任务" | "发布任务" => Some(TaskStatus::Available),
        "接受任务" => Some(TaskStatus::Accepted),
        "完成任务" => Some(TaskStatus::Completed),
        _ => None,
    }
}

impl Extractor for TaskMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::Task
    }

    fn extract(&self, transcript: &Transcript) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for message in transcript.messages() {
            let mut ordinals: BTreeMap<(String, u8), usize> = BTreeMap::new();
            for tag in self.tags.parse(&message.text) {
                let Some(status) = task_status_for(tag.name) else {
                    continue;
                };
                let Some(id) = tag.field(0) else {
                    continue;
                };

                // [status|id|title|description...|reward]
                let rest = &tag.fields[1..];
                let reward = if rest.len() >= 2 {
                    rest.last()
                        .map(|value| value.trim())
                        .filter(|value| value.parse::<i64>().is_ok())
                } else {
                    None
                };
                let body_end = if reward.is_some() { rest.len() - 1 } else { rest.len() };
                let description: Vec<&str> = rest
                    .get(1..body_end)
                    .unwrap_or(&[])
                    .iter()
                    .map(|value| value.trim())
                    .filter(|value| !is_placeholder(value))
                    .collect();
                let description = (!description.is_empty()).then(|| description.join("|"));

                let ordinal = ordinals.entry((id.to_string(), status.rank())).or_insert(0);
                out.push(
                    Candidate::new(
                        id,
                        Observation::Task { status },
                        Position::new(message.index, *ordinal),
                    )
                    .with_field("title", tag.field(1))
                    .with_field("description", description.as_deref())
                    .with_field("reward", reward),
                );
                *ordinal += 1;
            }
        }
        Ok(out)
    }
}

// =============================================================================
// Inventory
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ItemAction {
    Acquire,
    Use,
}

pub struct InventoryMatcher {
    tags: TagParser,
    acquired: Regex,
    used: Regex,
    quantity_suffix: Regex,
}

impl InventoryMatcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tags: TagParser::new()?,
            acquired: Regex::new(r"(?:购买了|买了)\s*([^\s，。,.!！?？、；;\[\]|]+)")?,
            used: Regex::new(r"使用了\s*([^\s，。,.!！?？、；;\[\]|]+)")?,
            quantity_suffix: Regex::new(r"^(.+?)\s*[×xX*]\s*(\d+)$")?,
        })
    }

    /// Split `金币×3` into `("金币", 3)`.
    fn split_quantity<'a>(&self, raw: &'a str) -> (&'a str, i64) {
        match self.quantity_suffix.captures(raw) {
            Some(caps) => {
                let name = caps.get(1).map(|m| m.as_str()).unwrap_or(raw);
                let quantity = caps
                    .get(2)
                    .and_then(|m| m.as_str().parse::<i64>().ok())
                    .filter(|q| *q > 0)
                    .unwrap_or(1);
                (name, quantity)
            }
            None => (raw, 1),
        }
    }
}

fn item_action_for(tag: &str) -> Option<ItemAction> {
    match tag {
        "购买物品" | "获得物品" | "购买" => Some(ItemAction::Acquire),
        "使用物品" | "使用" => Some(ItemAction::Use),
        _ => None,
    }
}

/// Point amounts are not items even when phrased as "使用了10积分".
fn is_points_phrase(name: &str) -> bool {
    name.ends_with("积分")
}

impl Extractor for InventoryMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::InventoryItem
    }

    fn extract(&self, transcript: &Transcript) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for message in transcript.messages() {
            let mut events: BTreeMap<(ItemAction, String), Occurrences<i64>> = BTreeMap::new();
            let mut first_seen: Vec<(ItemAction, String)> = Vec::new();
            let mut note = |key: (ItemAction, String)| {
                if !first_seen.contains(&key) {
                    first_seen.push(key);
                }
            };

            for tag in self.tags.parse(&message.text) {
                let Some(action) = item_action_for(tag.name) else {
                    continue;
                };
                let Some(name) = tag.field(0) else {
                    continue;
                };
                let Some(quantity) = parse_quantity(tag.field(1)) else {
                    continue;
                };
                let key = (action, name.to_string());
                note(key.clone());
                events.entry(key).or_default().tagged.push(quantity);
            }

            for (action, re) in [(ItemAction::Acquire, &self.acquired), (ItemAction::Use, &self.used)] {
                for caps in re.captures_iter(&message.text) {
                    let Some(raw) = caps.get(1).map(|m| m.as_str()) else {
                        continue;
                    };
                    let (name, quantity) = self.split_quantity(raw);
                    if is_placeholder(name) || is_points_phrase(name) {
                        continue;
                    }
                    let key = (action, name.to_string());
                    note(key.clone());
                    events.entry(key).or_default().natural.push(quantity);
                }
            }

            for key in first_seen {
                let Some(occurrences) = events.remove(&key) else {
                    continue;
                };
                let (action, name) = key;
                for (ordinal, quantity) in occurrences.winner().into_iter().enumerate() {
                    let observation = match action {
                        ItemAction::Acquire => Observation::ItemAcquired { quantity },
                        ItemAction::Use => Observation::ItemUsed { quantity },
                    };
                    out.push(Candidate::new(
                        name.clone(),
                        observation,
                        Position::new(message.index, ordinal),
                    ));
                }
            }
        }
        Ok(out)
    }
}

// =============================================================================
// Contacts
// =============================================================================

pub struct ContactMatcher {
    tags: TagParser,
}

impl ContactMatcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tags: TagParser::new()?,
        })
    }
}

fn contact_status_for(tag: &str) -> Option<ContactStatus> {
    match tag {
        "好友申请" => Some(ContactStatus::Requested),
        "添加好友" | "好友" => Some(ContactStatus::Added),
        _ => None,
    }
}

impl Extractor for ContactMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::Contact
    }

    fn extract(&self, transcript: &Transcript) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for message in transcript.messages() {
            let mut ordinals: BTreeMap<String, usize> = BTreeMap::new();
            for tag in self.tags.parse(&message.text) {
                let Some(status) = contact_status_for(tag.name) else {
                    continue;
                };
                let Some(id) = tag.field(0) else {
                    continue;
                };
                let ordinal = ordinals.entry(id.to_string()).or_insert(0);
                out.push(
                    Candidate::new(
                        id,
                        Observation::Contact { status },
                        Position::new(message.index, *ordinal),
                    )
                    .with_field("name", tag.field(1)),
                );
                *ordinal += 1;
            }
        }
        Ok(out)
    }
}

// =============================================================================
// Points
// =============================================================================

pub struct PointsMatcher {
    tags: TagParser,
    earned: Regex,
    spent: Regex,
}

impl PointsMatcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tags: TagParser::new()?,
            earned: Regex::new(r"(?:获得|赚取|奖励)了?\s*(\d+)\s*积分")?,
            spent: Regex::new(r"(?:消耗|花费|扣除|使用)了?\s*(\d+)\s*积分")?,
        })
    }
}

fn parse_signed_points(raw: &str) -> Option<(i64, PointsDirection)> {
    let raw = raw.trim();
    let (direction, digits) = match raw.strip_prefix('-') {
        Some(rest) => (PointsDirection::Spent, rest),
        None => (PointsDirection::Earned, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let amount = digits.trim().parse::<i64>().ok().filter(|a| *a > 0)?;
    Some((amount, direction))
}

impl Extractor for PointsMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::PointsEvent
    }

    fn extract(&self, transcript: &Transcript) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for message in transcript.messages() {
            let mut events: BTreeMap<(PointsDirection, i64), Occurrences<String>> =
                BTreeMap::new();

            for tag in self.tags.parse(&message.text) {
                if tag.name != "积分" {
                    continue;
                }
                let Some((amount, direction)) = tag.field(0).and_then(parse_signed_points) else {
                    continue;
                };
                let source = tag.field(1).unwrap_or(NATURAL_POINTS_SOURCE).to_string();
                events
                    .entry((direction, amount))
                    .or_default()
                    .tagged
                    .push(source);
            }

            for (direction, re) in [
                (PointsDirection::Earned, &self.earned),
                (PointsDirection::Spent, &self.spent),
            ] {
                for caps in re.captures_iter(&message.text) {
                    let Some(amount) = caps
                        .get(1)
                        .and_then(|m| m.as_str().parse::<i64>().ok())
                        .filter(|a| *a > 0)
                    else {
                        continue;
                    };
                    events
                        .entry((direction, amount))
                        .or_default()
                        .natural
                        .push(NATURAL_POINTS_SOURCE.to_string());
                }
            }

            for ((direction, amount), occurrences) in events {
                for (ordinal, source) in occurrences.winner().into_iter().enumerate() {
                    let sign = match direction {
                        PointsDirection::Earned => '+',
                        PointsDirection::Spent => '-',
                    };
                    let id = format!("{source}:{sign}{amount}@{}.{ordinal}", message.index);
                    out.push(Candidate::new(
                        id,
                        Observation::Points {
                            amount,
                            direction,
                            source,
                        },
                        Position::new(message.index, ordinal),
                    ));
                }
            }
        }
        Ok(out)
    }
}

// =============================================================================
// Red envelopes
// =============================================================================

pub struct RedEnvelopeMatcher {
    tags: TagParser,
}

impl RedEnvelopeMatcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tags: TagParser::new()?,
        })
    }
}

impl Extractor for RedEnvelopeMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::RedEnvelope
    }

    fn extract(&self, transcript: &Transcript) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for message in transcript.messages() {
            let mut ordinals: BTreeMap<String, usize> = BTreeMap::new();
            for tag in self.tags.parse(&message.text) {
                let (status, sender, amount) = match tag.name {
                    // [红包|id|sender|amount]
                    "红包" => (EnvelopeStatus::Sent, tag.field(1), tag.field(2)),
                    // [领取红包|id|amount]
                    "领取红包" | "打开红包" => (EnvelopeStatus::Opened, None, tag.field(1)),
                    _ => continue,
                };
                let Some(id) = tag.field(0) else {
                    continue;
                };
                let ordinal = ordinals.entry(id.to_string()).or_insert(0);
                out.push(
                    Candidate::new(
                        id,
                        Observation::RedEnvelope { status },
                        Position::new(message.index, *ordinal),
                    )
                    .with_field("sender", sender)
                    .with_field("amount", amount),
                );
                *ordinal += 1;
            }
        }
        Ok(out)
    }
}

// =============================================================================
// Avatars
// =============================================================================

pub struct AvatarMatcher {
    tags: TagParser,
}

impl AvatarMatcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tags: TagParser::new()?,
        })
    }
}

impl Extractor for AvatarMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::Avatar
    }

    fn extract(&self, transcript: &Transcript) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for message in transcript.messages() {
            let mut ordinals: BTreeMap<String, usize> = BTreeMap::new();
            for tag in self.tags.parse(&message.text) {
                if tag.name != "头像" {
                    continue;
                }
                let (Some(id), Some(url)) = (tag.field(0), tag.field(1)) else {
                    continue;
                };
                let ordinal = ordinals.entry(id.to_string()).or_insert(0);
                out.push(
                    Candidate::new(id, Observation::Avatar, Position::new(message.index, *ordinal))
                        .with_field("url", Some(url)),
                );
                *ordinal += 1;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{Message, Role};

    fn transcript(lines: &[&str]) -> Transcript {
        Transcript::new(
            lines
                .iter()
                .enumerate()
                .map(|(index, text)| Message::new(index, Role::Other, *text))
                .collect(),
        )
    }

    #[test]
    fn tag_parser_splits_fields() {
        let parser = TagParser::new().expect("parser");
        let tags = parser.parse("前缀 [接受任务|42|Fetch Water|...|10] 中间 [好友]");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].name, "接受任务");
        assert_eq!(tags[0].fields, vec!["42", "Fetch Water", "...", "10"]);
        assert_eq!(tags[1].name, "好友");
        assert!(tags[1].fields.is_empty());
    }

    #[test]
    fn task_fields_are_mapped() {
        let matcher = TaskMatcher::new().expect("matcher");
        let candidates = matcher
            .extract(&transcript(&[
                "[查看任务|42|...]",
                "[接受任务|42|Fetch Water|Carry two buckets|10]",
                "[完成任务|42|Fetch Water|10]",
            ]))
            .expect("extract");
        assert_eq!(candidates.len(), 3);
        assert!(candidates[0].payload.is_empty());

        let accepted = &candidates[1];
        assert_eq!(
            accepted.observation,
            Observation::Task {
                status: TaskStatus::Accepted
            }
        );
        assert_eq!(accepted.payload.get("title").map(String::as_str), Some("Fetch Water"));
        assert_eq!(
            accepted.payload.get("description").map(String::as_str),
            Some("Carry two buckets")
        );
        assert_eq!(accepted.payload.get("reward").map(String::as_str), Some("10"));
        assert_eq!(candidates[2].position, Position::new(2, 0));
    }

    #[test]
    fn inventory_matches_every_occurrence() {
        let matcher = InventoryMatcher::new().expect("matcher");
        let candidates = matcher
            .extract(&transcript(&["使用了金币，又使用了金币", "购买了药水×3"]))
            .expect("extract");
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].position, Position::new(0, 0));
        assert_eq!(candidates[1].position, Position::new(0, 1));
        assert_eq!(candidates[2].id, "药水");
        assert_eq!(candidates[2].observation, Observation::ItemAcquired { quantity: 3 });
    }

    #[test]
    fn inventory_variants_collapse_to_one_event() {
        let matcher = InventoryMatcher::new().expect("matcher");
        let candidates = matcher
            .extract(&transcript(&["使用了金币 [使用物品|金币]"]))
            .expect("extract");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "金币");
    }

    #[test]
    fn inventory_ignores_points_phrases() {
        let matcher = InventoryMatcher::new().expect("matcher");
        let candidates = matcher
            .extract(&transcript(&["使用了20积分"]))
            .expect("extract");
        assert!(candidates.is_empty());
    }

    #[test]
    fn points_tag_and_phrase_are_one_event() {
        let matcher = PointsMatcher::new().expect("matcher");
        let candidates = matcher
            .extract(&transcript(&[
                "获得10积分 [积分|+10|签到]",
                "[积分|-4|商店] 花费了6积分",
            ]))
            .expect("extract");
        assert_eq!(candidates.len(), 3);
        match &candidates[0].observation {
            Observation::Points { amount, direction, source } => {
                assert_eq!(*amount, 10);
                assert_eq!(*direction, PointsDirection::Earned);
                assert_eq!(source, "签到");
            }
            other => panic!("unexpected observation: {other:?}"),
        }
        let spent: i64 = candidates[1..]
            .iter()
            .map(|c| match &c.observation {
                Observation::Points { amount, .. } => *amount,
                _ => 0,
            })
            .sum();
        assert_eq!(spent, 10);
    }

    #[test]
    fn contacts_envelopes_and_avatars() {
        let text = "[好友申请|10001|小明] [红包|rp-1|小明|8.88] [领取红包|rp-1] [头像|10001|https://img/a.png]";
        let t = transcript(&[text]);

        let contacts = ContactMatcher::new().unwrap().extract(&t).unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].payload.get("name").map(String::as_str), Some("小明"));

        let envelopes = RedEnvelopeMatcher::new().unwrap().extract(&t).unwrap();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(
            envelopes[1].observation,
            Observation::RedEnvelope {
                status: EnvelopeStatus::Opened
            }
        );

        let avatars = AvatarMatcher::new().unwrap().extract(&t).unwrap();
        assert_eq!(avatars.len(), 1);
        assert_eq!(
            avatars[0].payload.get("url").map(String::as_str),
            Some("https://img/a.png")
        );
    }
}
