//! Correlates HP-loss readings with bed/anchor consumption.
//!
//! Greedy: strongest hits pick first, a tight pass runs before a wide pass, and a
//! consumed use can never be matched twice. Not an optimal bipartite matching.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplodeEvent {
    pub gt: i64,
    pub beds: i64,
    pub anchors: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DamageEvent {
    pub gt: i64,
    pub hp_loss: i64,
    pub explode_beds: i64,
    pub explode_anchors: i64,
    pub near_bed_drop: i64,
    pub near_anchor_drop: i64,
    pub bed_damage: i64,
    pub anchor_damage: i64,
    pub other_damage: i64,
}

impl DamageEvent {
    pub fn has_direct_split(&self) -> bool {
        self.bed_damage > 0 || self.anchor_damage > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageSource {
    Bed,
    Anchor,
    Other,
    MixedExplosive,
    MixedBedOther,
    MixedAnchorOther,
    Mixed,
}

impl DamageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DamageSource::Bed => "bed",
            DamageSource::Anchor => "anchor",
            DamageSource::Other => "other",
            DamageSource::MixedExplosive => "mixed_explosive",
            DamageSource::MixedBedOther => "mixed_bed_other",
            DamageSource::MixedAnchorOther => "mixed_anchor_other",
            DamageSource::Mixed => "mixed",
        }
    }

    /// Everything except pure `other` involves a bed or anchor.
    pub fn is_explosive(self) -> bool {
        !matches!(self, DamageSource::Other)
    }

    /// Source implied by which direct sub-splits are positive.
    pub fn from_direct_split(event: &DamageEvent) -> Self {
        let bed = event.bed_damage > 0;
        let anchor = event.anchor_damage > 0;
        let other = event.other_damage > 0;
        match (bed, anchor, other) {
            (true, false, false) => DamageSource::Bed,
            (false, true, false) => DamageSource::Anchor,
            (false, false, _) => DamageSource::Other,
            (true, true, false) => DamageSource::MixedExplosive,
            (true, false, true) => DamageSource::MixedBedOther,
            (false, true, true) => DamageSource::MixedAnchorOther,
            (true, true, true) => DamageSource::Mixed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributedDamage {
    pub event: DamageEvent,
    pub source: DamageSource,
    pub matched_use_gt: Option<i64>,
    pub matched_dt: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributionWindows {
    pub tight_bed_ticks: i64,
    pub tight_anchor_ticks: i64,
    pub wide_bed_ticks: i64,
    pub wide_anchor_ticks: i64,
}

impl Default for AttributionWindows {
    fn default() -> Self {
        Self {
            tight_bed_ticks: 24,
            tight_anchor_ticks: 48,
            wide_bed_ticks: 220,
            wide_anchor_ticks: 320,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UseKind {
    Bed,
    Anchor,
}

struct UseToken {
    gt: i64,
    kind: UseKind,
    consumed: bool,
}

fn use_tokens(explode_events: &[ExplodeEvent]) -> Vec<UseToken> {
    let mut tokens = Vec::new();
    for event in explode_events {
        for _ in 0..event.beds.max(0) {
            tokens.push(UseToken {
                gt: event.gt,
                kind: UseKind::Bed,
                consumed: false,
            });
        }
        for _ in 0..event.anchors.max(0) {
            tokens.push(UseToken {
                gt: event.gt,
                kind: UseKind::Anchor,
                consumed: false,
            });
        }
    }
    tokens
}

fn match_pass(
    attributed: &mut [AttributedDamage],
    tokens: &mut [UseToken],
    bed_window: i64,
    anchor_window: i64,
) {
    let mut order: Vec<usize> = (0..attributed.len()).collect();
    order.sort_by_key(|index| {
        let event = &attributed[*index].event;
        (-event.hp_loss, event.gt)
    });

    for index in order {
        if attributed[index].source != DamageSource::Other {
            continue;
        }
        let damage_gt = attributed[index].event.gt;

        let best = tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| !token.consumed)
            .filter_map(|(token_index, token)| {
                let delta = damage_gt - token.gt;
                let window = match token.kind {
                    UseKind::Bed => bed_window,
                    UseKind::Anchor => anchor_window,
                };
                (0..=window)
                    .contains(&delta)
                    .then_some((token_index, delta, token.gt))
            })
            .min_by_key(|(_, delta, use_gt)| (*delta, -*use_gt));

        let Some((token_index, delta, use_gt)) = best else {
            continue;
        };

        tokens[token_index].consumed = true;
        let entry = &mut attributed[index];
        entry.source = match tokens[token_index].kind {
            UseKind::Bed => DamageSource::Bed,
            UseKind::Anchor => DamageSource::Anchor,
        };
        entry.matched_use_gt = Some(use_gt);
        entry.matched_dt = Some(delta);
    }
}

/// Tags each damage event with the bed/anchor use that most plausibly caused it.
/// Output keeps the order of `damage_events`.
pub fn attribute_damage(
    explode_events: &[ExplodeEvent],
    damage_events: &[DamageEvent],
    windows: &AttributionWindows,
) -> Vec<AttributedDamage> {
    let mut tokens = use_tokens(explode_events);
    let mut attributed: Vec<AttributedDamage> = damage_events
        .iter()
        .map(|event| AttributedDamage {
            event: *event,
            source: DamageSource::Other,
            matched_use_gt: None,
            matched_dt: None,
        })
        .collect();

    match_pass(
        &mut attributed,
        &mut tokens,
        windows.tight_bed_ticks,
        windows.tight_anchor_ticks,
    );
    match_pass(
        &mut attributed,
        &mut tokens,
        windows.wide_bed_ticks,
        windows.wide_anchor_ticks,
    );

    attributed
}

#[cfg(test)]
mod tests {
    use super::{
        attribute_damage, AttributionWindows, DamageEvent, DamageSource, ExplodeEvent,
    };

    fn damage(gt: i64, hp_loss: i64) -> DamageEvent {
        DamageEvent {
            gt,
            hp_loss,
            ..DamageEvent::default()
        }
    }

    #[test]
    fn matches_damage_to_recent_bed_in_tight_window() {
        let attributed = attribute_damage(
            &[ExplodeEvent {
                gt: 100,
                beds: 1,
                anchors: 0,
            }],
            &[damage(105, 50)],
            &AttributionWindows::default(),
        );

        assert_eq!(attributed.len(), 1);
        assert_eq!(attributed[0].source, DamageSource::Bed);
        assert_eq!(attributed[0].matched_use_gt, Some(100));
        assert_eq!(attributed[0].matched_dt, Some(5));
    }

    #[test]
    fn strongest_hit_claims_the_only_use() {
        let attributed = attribute_damage(
            &[ExplodeEvent {
                gt: 100,
                beds: 1,
                anchors: 0,
            }],
            &[damage(102, 4), damage(110, 40)],
            &AttributionWindows::default(),
        );

        assert_eq!(attributed[0].source, DamageSource::Other);
        assert_eq!(attributed[1].source, DamageSource::Bed);
    }

    #[test]
    fn wide_pass_catches_delayed_anchor_damage() {
        let attributed = attribute_damage(
            &[ExplodeEvent {
                gt: 100,
                beds: 0,
                anchors: 1,
            }],
            &[damage(400, 30), damage(90, 12)],
            &AttributionWindows::default(),
        );

        assert_eq!(attributed[0].source, DamageSource::Anchor);
        assert_eq!(attributed[0].matched_dt, Some(300));
        assert_eq!(attributed[1].source, DamageSource::Other);
    }

    #[test]
    fn picks_nearest_use_and_leaves_older_use_for_wide_pass() {
        let attributed = attribute_damage(
            &[
                ExplodeEvent {
                    gt: 90,
                    beds: 1,
                    anchors: 0,
                },
                ExplodeEvent {
                    gt: 100,
                    beds: 1,
                    anchors: 0,
                },
            ],
            &[damage(104, 20), damage(300, 10)],
            &AttributionWindows::default(),
        );

        assert_eq!(attributed[0].matched_use_gt, Some(100));
        assert_eq!(attributed[1].source, DamageSource::Bed);
        assert_eq!(attributed[1].matched_use_gt, Some(90));
    }

    #[test]
    fn classifies_direct_splits() {
        let split = |bed, anchor, other| {
            DamageSource::from_direct_split(&DamageEvent {
                bed_damage: bed,
                anchor_damage: anchor,
                other_damage: other,
                ..DamageEvent::default()
            })
        };

        assert_eq!(split(5, 0, 0), DamageSource::Bed);
        assert_eq!(split(0, 5, 0), DamageSource::Anchor);
        assert_eq!(split(0, 0, 5), DamageSource::Other);
        assert_eq!(split(5, 5, 0), DamageSource::MixedExplosive);
        assert_eq!(split(5, 0, 5), DamageSource::MixedBedOther);
        assert_eq!(split(0, 5, 5), DamageSource::MixedAnchorOther);
        assert_eq!(split(5, 5, 5), DamageSource::Mixed);
        assert!(!DamageSource::Other.is_explosive());
    }

    #[test]
    fn direct_split_needs_bed_or_anchor_share() {
        let event = |bed, anchor, other| DamageEvent {
            hp_loss: bed + anchor + other,
            bed_damage: bed,
            anchor_damage: anchor,
            other_damage: other,
            ..DamageEvent::default()
        };

        assert!(event(3, 0, 0).has_direct_split());
        assert!(event(0, 2, 1).has_direct_split());
        assert!(!event(0, 0, 4).has_direct_split());
    }
}
