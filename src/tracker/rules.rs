//! Ordered chat rule table. The first rule whose pattern matches wins.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

pub const CONTEXT_MESSAGE_PREFIX: &str = "[ZDASH] ";

#[derive(Debug, Clone, PartialEq)]
pub enum ChatSignal {
    ContextTower { name: String, code: Option<String> },
    ContextZeroType(String),
    FirstBedPlaced { seconds: f64 },
    Damage(i64),
    DistanceBlocks(f64),
    DragonKilled,
    CrystalDestroyed,
    Explosives { used: i64, left: Option<i64> },
    RunTime(f64),
    RecapTower { name: String, code: Option<String> },
    RecapZeroType(String),
    StandingHeight(i64),
}

impl ChatSignal {
    /// Signals that are acted on even when no attempt is open.
    pub fn applies_while_idle(&self) -> bool {
        matches!(
            self,
            ChatSignal::ContextTower { .. }
                | ChatSignal::ContextZeroType(_)
                | ChatSignal::FirstBedPlaced { .. }
        )
    }
}

struct ChatRule {
    pattern: &'static Regex,
    build: fn(&Captures<'_>) -> Option<ChatSignal>,
}

lazy_static! {
    static ref ZDASH_TOWER: Regex =
        Regex::new(r"^\[ZDASH\]\s*Tower:\s*(?P<tower>.+)$").expect("valid zdash tower pattern");
    static ref ZDASH_TYPE: Regex = Regex::new(r"^\[ZDASH\]\s*Type:\s*(?P<zero_type>.+)$")
        .expect("valid zdash type pattern");
    static ref FIRST_BED: Regex = Regex::new(r"^(?P<seconds>\d+(?:\.\d+)?)s 1st Bed Placed$")
        .expect("valid first bed pattern");
    static ref DAMAGE: Regex =
        Regex::new(r"^Damage:\s*(?P<damage>\d+)$").expect("valid damage pattern");
    static ref BLOCKS: Regex =
        Regex::new(r"^(?P<blocks>\d+(?:\.\d+)?) Blocks$").expect("valid blocks pattern");
    static ref DRAGON_KILLED: Regex =
        Regex::new(r"(?i)dragon killed!").expect("valid dragon killed pattern");
    static ref CRYSTAL_DESTROYED: Regex =
        Regex::new(r"(?i)crystal destroyed").expect("valid crystal pattern");
    static ref EXPLOSIVES: Regex = Regex::new(r"^Explosives:\s*(?P<used>\d+)(?:\+(?P<left>\d+))?$")
        .expect("valid explosives pattern");
    static ref RUN_TIME: Regex =
        Regex::new(r"^Time:\s*(?P<seconds>\d+(?:\.\d+)?)s$").expect("valid run time pattern");
    static ref TOWER: Regex = Regex::new(r"^Tower:\s*(?P<tower>.+?)(?:\s+\((?P<code>\d+)\))?$")
        .expect("valid tower pattern");
    static ref ZERO_TYPE: Regex =
        Regex::new(r"^Type:\s*(?P<zero_type>.+)$").expect("valid type pattern");
    static ref STANDING_HEIGHT: Regex = Regex::new(r"^Standing Height:\s*(?P<height>\d+)$")
        .expect("valid standing height pattern");
    static ref CHAT_RULES: Vec<ChatRule> = vec![
        ChatRule {
            pattern: &ZDASH_TOWER,
            build: |captures| {
                let (name, code) = split_tower_text(captures.name("tower")?.as_str());
                Some(ChatSignal::ContextTower { name, code })
            },
        },
        ChatRule {
            pattern: &ZDASH_TYPE,
            build: |captures| {
                Some(ChatSignal::ContextZeroType(
                    captures.name("zero_type")?.as_str().trim().to_string(),
                ))
            },
        },
        ChatRule {
            pattern: &FIRST_BED,
            build: |captures| {
                Some(ChatSignal::FirstBedPlaced {
                    seconds: captures.name("seconds")?.as_str().parse().ok()?,
                })
            },
        },
        ChatRule {
            pattern: &DAMAGE,
            build: |captures| Some(ChatSignal::Damage(captures.name("damage")?.as_str().parse().ok()?)),
        },
        ChatRule {
            pattern: &BLOCKS,
            build: |captures| {
                Some(ChatSignal::DistanceBlocks(
                    captures.name("blocks")?.as_str().parse().ok()?,
                ))
            },
        },
        ChatRule {
            pattern: &DRAGON_KILLED,
            build: |_| Some(ChatSignal::DragonKilled),
        },
        ChatRule {
            pattern: &CRYSTAL_DESTROYED,
            build: |_| Some(ChatSignal::CrystalDestroyed),
        },
        ChatRule {
            pattern: &EXPLOSIVES,
            build: |captures| {
                let left = match captures.name("left") {
                    Some(value) => Some(value.as_str().parse().ok()?),
                    None => None,
                };
                Some(ChatSignal::Explosives {
                    used: captures.name("used")?.as_str().parse().ok()?,
                    left,
                })
            },
        },
        ChatRule {
            pattern: &RUN_TIME,
            build: |captures| Some(ChatSignal::RunTime(captures.name("seconds")?.as_str().parse().ok()?)),
        },
        ChatRule {
            pattern: &TOWER,
            build: |captures| {
                Some(ChatSignal::RecapTower {
                    name: captures.name("tower")?.as_str().trim().to_string(),
                    code: captures.name("code").map(|code| code.as_str().to_string()),
                })
            },
        },
        ChatRule {
            pattern: &ZERO_TYPE,
            build: |captures| {
                Some(ChatSignal::RecapZeroType(
                    captures.name("zero_type")?.as_str().trim().to_string(),
                ))
            },
        },
        ChatRule {
            pattern: &STANDING_HEIGHT,
            build: |captures| {
                Some(ChatSignal::StandingHeight(
                    captures.name("height")?.as_str().parse().ok()?,
                ))
            },
        },
    ];
}

/// Splits `Tall Boy (103)` into a name and an optional numeric code.
pub fn split_tower_text(text: &str) -> (String, Option<String>) {
    let text = text.trim();
    match TOWER.captures(&format!("Tower: {text}")) {
        Some(captures) => (
            captures
                .name("tower")
                .map(|name| name.as_str().trim().to_string())
                .unwrap_or_else(|| text.to_string()),
            captures.name("code").map(|code| code.as_str().to_string()),
        ),
        None => (text.to_string(), None),
    }
}

pub fn classify_chat_message(message: &str) -> Option<ChatSignal> {
    let message = message.trim();
    CHAT_RULES.iter().find_map(|rule| {
        let captures = rule.pattern.captures(message)?;
        (rule.build)(&captures)
    })
}

/// Non-chat lines that mean the player is no longer on the practice map.
pub fn is_left_practice_line(body: &str) -> bool {
    let lower = body.trim().to_lowercase();
    if lower.is_empty() {
        return false;
    }
    lower.contains("stateoutput state: title")
        || lower.contains("stateoutput state: waiting")
        || lower.contains("disconnecting from server")
        || lower == "stopping!"
}
