//! Decoding of per-world telemetry snapshots (`command_storage_*.dat`).

pub mod attribution;
pub mod classify;
pub mod nbt;
pub mod terrain;

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use attribution::{
    attribute_damage, AttributedDamage, AttributionWindows, DamageEvent, DamageSource,
    ExplodeEvent,
};
use classify::{
    dominant_node, node_hit_counts, rotation, zero_type_label, Node, NodeHitCount, Rotation,
    Sample,
};
use nbt::{Tag, TagExt};
use terrain::{ceilings_by_node, TerrainProbe};

const SCALED_DAMAGE_THRESHOLD: i64 = 500;
const SCALED_DAMAGE_FACTOR: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndEntry {
    pub logged: bool,
    pub gt: i64,
    pub player_y: i64,
    pub top_y: i64,
    pub top_is_endstone: bool,
}

/// Counters and event lists from the snapshot's `tracker.run` section.
///
/// Damage figures in `attributed_damage` and the `*_damage` totals are already
/// divided down when the file uses the x100 encoding; `damage_events` keeps the
/// raw values.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub pack_version: String,
    pub run_active: bool,
    pub run_start_gt: i64,
    pub run_end_gt: i64,
    pub sample_count: usize,
    pub last_sample_gt: i64,
    pub dragon_died: bool,
    pub dragon_died_gt: i64,
    pub flyaway_detected: bool,
    pub flyaway_gt: i64,
    pub flyaway_dragon_y: Option<i64>,
    pub flyaway_node: Option<String>,
    pub flyaway_crystals_alive: Option<i64>,
    pub end_entry: EndEntry,
    pub explosive_standing_y: Option<i64>,
    pub beds_exploded: i64,
    pub anchors_interactions: i64,
    pub anchors_exploded: i64,
    pub bows_shot: i64,
    pub crossbows_shot: i64,
    pub explosives_base_count: i64,
    pub explosives_plus_one_count: i64,
    pub damage_scale: i64,
    pub bed_damage: i64,
    pub anchor_damage: i64,
    pub other_damage: i64,
    pub explode_events: Vec<ExplodeEvent>,
    pub damage_events: Vec<DamageEvent>,
    pub attributed_damage: Vec<AttributedDamage>,
}

impl RunMetrics {
    /// True while the datapack has not written anything for this world yet.
    pub fn looks_uninitialized(&self) -> bool {
        self.run_start_gt <= 0
            && self.run_end_gt <= 0
            && self.sample_count == 0
            && !self.end_entry.logged
            && self.damage_events.is_empty()
            && self.beds_exploded <= 0
            && self.anchors_exploded <= 0
    }

    pub fn final_gt(&self) -> i64 {
        [self.dragon_died_gt, self.run_end_gt, self.last_sample_gt]
            .into_iter()
            .filter(|gt| *gt > 0)
            .max()
            .unwrap_or(0)
    }

    /// Ticks spent in the End after the logged entry, 0 without an entry.
    pub fn end_ticks(&self) -> i64 {
        let final_gt = self.final_gt();
        if self.end_entry.logged && final_gt > self.end_entry.gt {
            final_gt - self.end_entry.gt
        } else {
            0
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        let final_gt = self.final_gt();
        if final_gt > self.run_start_gt {
            (final_gt - self.run_start_gt) as f64 / 20.0
        } else {
            0.0
        }
    }

    pub fn o_level(&self) -> Option<i64> {
        (self.end_entry.logged && self.end_entry.top_y >= 0).then_some(self.end_entry.top_y)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub samples_path: Option<String>,
    pub samples: Vec<Sample>,
    pub metrics: Option<RunMetrics>,
}

/// Reads a snapshot file; unreadable or malformed files yield an empty snapshot.
pub fn decode_snapshot(path: &Path) -> TelemetrySnapshot {
    match nbt::read_gzip_file(path) {
        Ok(root) => decode_snapshot_tree(&root),
        Err(error) => {
            tracing::warn!(path = %path.display(), error = %error, "Failed to decode telemetry snapshot");
            TelemetrySnapshot::default()
        }
    }
}

pub fn decode_snapshot_tree(root: &Tag) -> TelemetrySnapshot {
    let (samples_path, samples) = match root.find_section("samples", is_sample_list) {
        Some((path, tag)) => (Some(path), parse_samples(tag)),
        None => (None, Vec::new()),
    };

    let metrics = root
        .find_section("tracker", |tag| tag.is_compound())
        .and_then(|(_, tracker)| parse_run_metrics(tracker, &samples));

    TelemetrySnapshot {
        samples_path,
        samples,
        metrics,
    }
}

fn is_sample_list(tag: &Tag) -> bool {
    let Some(items) = tag.items() else {
        return false;
    };
    items.iter().all(|item| {
        ["x", "y", "z"]
            .iter()
            .all(|axis| item.field(axis).is_some())
    })
}

fn parse_samples(tag: &Tag) -> Vec<Sample> {
    tag.items()
        .unwrap_or_default()
        .iter()
        .map(|item| Sample {
            x: item.int_field("x"),
            y: item.int_field("y"),
            z: item.int_field("z"),
            gt: item.int_field("gt"),
        })
        .collect()
}

fn ceiling_half(raw: i64) -> i64 {
    if raw > 0 {
        (raw + 1) / 2
    } else {
        0
    }
}

fn parse_explode_events(list: Option<&Tag>) -> Vec<ExplodeEvent> {
    let mut events: Vec<ExplodeEvent> = list
        .and_then(TagExt::items)
        .unwrap_or_default()
        .iter()
        .filter(|item| item.is_compound())
        .map(|item| ExplodeEvent {
            gt: item.int_field("gt"),
            beds: item.int_field("explode_beds"),
            // the anchor drop counter sees each explosion twice
            anchors: ceiling_half(item.int_field("explode_anchors")),
        })
        .filter(|event| event.beds > 0 || event.anchors > 0)
        .collect();
    events.sort_by_key(|event| event.gt);
    events
}

fn parse_damage_events(list: Option<&Tag>) -> Vec<DamageEvent> {
    let mut events: Vec<DamageEvent> = list
        .and_then(TagExt::items)
        .unwrap_or_default()
        .iter()
        .filter(|item| item.is_compound())
        .map(|item| DamageEvent {
            gt: item.int_field("gt"),
            hp_loss: item.int_field("hp_diff_scaled"),
            explode_beds: item.int_field("explode_beds"),
            explode_anchors: ceiling_half(item.int_field("explode_anchors")),
            near_bed_drop: item.int_field("near_bed_drop"),
            near_anchor_drop: item.int_field("near_anchor_drop"),
            bed_damage: item.int_field("bed_dmg_scaled"),
            anchor_damage: item.int_field("anchor_dmg_scaled"),
            other_damage: item.int_field("other_dmg_scaled"),
        })
        .filter(|event| event.hp_loss > 0)
        .collect();
    events.sort_by_key(|event| event.gt);
    events
}

fn rescale(value: i64, scale: i64) -> i64 {
    if scale == 1 {
        value
    } else {
        (value as f64 / scale as f64).round_ties_even() as i64
    }
}

fn optional_field(section: &Tag, key: &str) -> Option<i64> {
    section.field(key).and_then(TagExt::integer)
}

fn parse_run_metrics(tracker: &Tag, samples: &[Sample]) -> Option<RunMetrics> {
    let run = tracker.field("run").filter(|tag| tag.is_compound())?;
    let empty = Tag::Compound(HashMap::new());
    let section = |key: &str| {
        run.field(key)
            .filter(|tag| tag.is_compound())
            .unwrap_or(&empty)
    };
    let deltas = section("deltas");
    let end_entry = section("end_entry");
    let explosive_stand = section("explosive_stand");

    let pack_version = tracker
        .field("meta")
        .and_then(|meta| meta.field("version"))
        .map(|version| match version {
            Tag::String(text) => text.clone(),
            other => other.integer().map(|value| value.to_string()).unwrap_or_default(),
        })
        .unwrap_or_default();

    let explode_events = parse_explode_events(run.field("explode_events"));
    let damage_events = parse_damage_events(run.field("damage_events"));
    let damage_scale = if damage_events
        .iter()
        .any(|event| event.hp_loss > SCALED_DAMAGE_THRESHOLD)
    {
        SCALED_DAMAGE_FACTOR
    } else {
        1
    };

    let has_direct_split = damage_events.iter().any(DamageEvent::has_direct_split);

    let mut attributed_damage: Vec<AttributedDamage> = if has_direct_split {
        damage_events
            .iter()
            .map(|event| AttributedDamage {
                event: *event,
                source: DamageSource::from_direct_split(event),
                matched_use_gt: None,
                matched_dt: None,
            })
            .collect()
    } else {
        attribute_damage(
            &explode_events,
            &damage_events,
            &AttributionWindows::default(),
        )
    };

    let (bed_damage, anchor_damage, other_damage) = if has_direct_split {
        damage_events.iter().fold((0, 0, 0), |totals, event| {
            (
                totals.0 + event.bed_damage,
                totals.1 + event.anchor_damage,
                totals.2 + event.other_damage,
            )
        })
    } else {
        attributed_damage.iter().fold((0, 0, 0), |totals, entry| {
            let hp = entry.event.hp_loss;
            match entry.source {
                DamageSource::Bed => (totals.0 + hp, totals.1, totals.2),
                DamageSource::Anchor => (totals.0, totals.1 + hp, totals.2),
                _ => (totals.0, totals.1, totals.2 + hp),
            }
        })
    };

    for entry in &mut attributed_damage {
        let event = &mut entry.event;
        event.hp_loss = rescale(event.hp_loss, damage_scale);
        event.bed_damage = rescale(event.bed_damage, damage_scale);
        event.anchor_damage = rescale(event.anchor_damage, damage_scale);
        event.other_damage = rescale(event.other_damage, damage_scale);
    }

    let explosive_standing_logged = explosive_stand.flag_field("logged");
    let flyaway_crystals_alive =
        optional_field(run, "flyaway_crystals_alive").filter(|count| *count >= 0);

    Some(RunMetrics {
        pack_version,
        run_active: run.flag_field("active"),
        run_start_gt: run.int_field("start_gt"),
        run_end_gt: run.int_field("end_gt"),
        sample_count: samples.len(),
        last_sample_gt: samples.last().map(|sample| sample.gt).unwrap_or(0),
        dragon_died: run.flag_field("dragon_died"),
        dragon_died_gt: run.int_field("dragon_died_gt"),
        flyaway_detected: run.flag_field("flyaway_detected"),
        flyaway_gt: run.int_field("flyaway_detected_gt"),
        flyaway_dragon_y: optional_field(run, "flyaway_dragon_y"),
        flyaway_node: run
            .field("flyaway_node")
            .and_then(TagExt::text)
            .filter(|node| !node.is_empty())
            .map(str::to_string),
        flyaway_crystals_alive,
        end_entry: EndEntry {
            logged: end_entry.flag_field("logged"),
            gt: end_entry.int_field("gt"),
            player_y: end_entry.int_field("player_y"),
            top_y: optional_field(end_entry, "top_y").unwrap_or(-1),
            top_is_endstone: end_entry.flag_field("top_is_endstone"),
        },
        explosive_standing_y: explosive_standing_logged
            .then(|| explosive_stand.int_field("y")),
        beds_exploded: deltas.int_field("beds_exploded"),
        anchors_interactions: deltas.int_field("anchors_interactions"),
        anchors_exploded: explode_events.iter().map(|event| event.anchors).sum(),
        bows_shot: deltas.int_field("bows_shot"),
        crossbows_shot: deltas.int_field("crossbows_shot"),
        explosives_base_count: run.int_field("explosives_base_count"),
        explosives_plus_one_count: run.int_field("explosives_plus_one_count"),
        damage_scale,
        bed_damage: rescale(bed_damage, damage_scale),
        anchor_damage: rescale(anchor_damage, damage_scale),
        other_damage: rescale(other_damage, damage_scale),
        explode_events,
        damage_events,
        attributed_damage,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCeiling {
    pub node: Node,
    pub x: i32,
    pub z: i32,
    pub ceiling_y: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotReport {
    pub storage_path: String,
    pub samples_path: Option<String>,
    pub sample_count: usize,
    pub window_ticks: i64,
    pub node_hits: Vec<NodeHitCount>,
    pub dominant_node: Option<Node>,
    pub rotation: Rotation,
    pub zero_type: String,
    pub metrics: Option<RunMetrics>,
    pub terrain: Option<Vec<NodeCeiling>>,
}

/// Debug view of one snapshot, optionally with terrain ceilings of its world.
pub fn inspect_snapshot(
    storage_path: &Path,
    world_dir: Option<&Path>,
    probe: &dyn TerrainProbe,
    window_ticks: i64,
    terrain_radius: i32,
) -> Result<SnapshotReport, String> {
    let root = nbt::read_gzip_file(storage_path).map_err(|error| {
        format!(
            "Failed to decode snapshot '{}': {error}",
            storage_path.display()
        )
    })?;
    let snapshot = decode_snapshot_tree(&root);

    let dominant = dominant_node(&snapshot.samples, window_ticks);
    let direction = rotation(&snapshot.samples, window_ticks);
    let terrain = world_dir.map(|world_dir| {
        ceilings_by_node(probe, world_dir, terrain_radius)
            .into_iter()
            .map(|(node, ceiling_y)| {
                let (x, z) = node.terrain_anchor();
                NodeCeiling {
                    node,
                    x,
                    z,
                    ceiling_y,
                }
            })
            .collect()
    });

    Ok(SnapshotReport {
        storage_path: storage_path.display().to_string(),
        samples_path: snapshot.samples_path,
        sample_count: snapshot.samples.len(),
        window_ticks,
        node_hits: node_hit_counts(&snapshot.samples, window_ticks),
        dominant_node: dominant,
        rotation: direction,
        zero_type: zero_type_label(dominant, direction),
        metrics: snapshot.metrics,
        terrain,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::nbt::writer::{compound, encode_root, gzip};
    use super::nbt::Tag;

    pub(crate) fn sample_tag(x: i64, z: i64, gt: i64) -> Tag {
        compound(vec![
            ("x", Tag::Int(x as i32)),
            ("y", Tag::Int(80_000)),
            ("z", Tag::Int(z as i32)),
            ("gt", Tag::Long(gt)),
        ])
    }

    /// Snapshot of a front-diagonal run that entered the End at tick 1000.
    pub(crate) fn front_diagonal_snapshot(dragon_died: bool, damage: Vec<Tag>, explodes: Vec<Tag>) -> Tag {
        let samples: Vec<Tag> = (0..10)
            .map(|index| sample_tag(29_000 + (index % 2) * 200, -29_000, 1000 + index * 30))
            .collect();

        compound(vec![(
            "data",
            compound(vec![(
                "contents",
                compound(vec![
                    (
                        "tracker",
                        compound(vec![
                            ("meta", compound(vec![("version", Tag::String("1.4".to_string()))])),
                            (
                                "run",
                                compound(vec![
                                    ("active", Tag::Byte(0)),
                                    ("start_gt", Tag::Long(400)),
                                    ("end_gt", Tag::Long(1600)),
                                    ("dragon_died", Tag::Byte(i8::from(dragon_died))),
                                    ("dragon_died_gt", Tag::Long(if dragon_died { 1500 } else { 0 })),
                                    (
                                        "deltas",
                                        compound(vec![
                                            ("beds_exploded", Tag::Int(3)),
                                            ("bows_shot", Tag::Int(1)),
                                        ]),
                                    ),
                                    (
                                        "end_entry",
                                        compound(vec![
                                            ("logged", Tag::Byte(1)),
                                            ("gt", Tag::Long(1000)),
                                            ("player_y", Tag::Int(64)),
                                            ("top_y", Tag::Int(48)),
                                            ("top_is_endstone", Tag::Byte(1)),
                                        ]),
                                    ),
                                    (
                                        "explosive_stand",
                                        compound(vec![("logged", Tag::Byte(1)), ("y", Tag::Int(101))]),
                                    ),
                                    ("explosives_base_count", Tag::Int(4)),
                                    ("explosives_plus_one_count", Tag::Int(1)),
                                    ("explode_events", Tag::List(explodes)),
                                    ("damage_events", Tag::List(damage)),
                                ]),
                            ),
                        ]),
                    ),
                    ("samples", Tag::List(samples)),
                ]),
            )]),
        )])
    }

    pub(crate) fn explode_tag(gt: i64, beds: i32, anchors: i32) -> Tag {
        compound(vec![
            ("gt", Tag::Long(gt)),
            ("explode_beds", Tag::Int(beds)),
            ("explode_anchors", Tag::Int(anchors)),
        ])
    }

    pub(crate) fn damage_tag(gt: i64, hp: i32) -> Tag {
        compound(vec![("gt", Tag::Long(gt)), ("hp_diff_scaled", Tag::Int(hp))])
    }

    /// Snapshot of a world the datapack has not written to yet.
    pub(crate) fn fresh_snapshot() -> Tag {
        compound(vec![(
            "data",
            compound(vec![(
                "contents",
                compound(vec![(
                    "tracker",
                    compound(vec![("run", compound(vec![("active", Tag::Byte(1))]))]),
                )]),
            )]),
        )])
    }

    /// Adds or replaces entries of the snapshot's `tracker.run` section.
    pub(crate) fn with_run_fields(mut root: Tag, fields: Vec<(&str, Tag)>) -> Tag {
        let mut section = &mut root;
        for key in ["data", "contents", "tracker", "run"] {
            let Tag::Compound(entries) = section else {
                panic!("Expected compound above run section");
            };
            section = entries.get_mut(key).expect("Expected run section path");
        }
        let Tag::Compound(run) = section else {
            panic!("Expected run compound");
        };
        for (name, value) in fields {
            run.insert(name.to_string(), value);
        }
        root
    }

    pub(crate) fn write_snapshot(path: &std::path::Path, root: &Tag) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Expected snapshot dir");
        }
        std::fs::write(path, gzip(&encode_root(root))).expect("Expected snapshot write");
    }
}

#[cfg(test)]
mod tests {
    use super::attribution::DamageSource;
    use super::classify::{Node, Rotation};
    use super::fixtures::{damage_tag, explode_tag, front_diagonal_snapshot, write_snapshot};
    use super::nbt::writer::compound;
    use super::nbt::Tag;
    use super::terrain::AnvilTerrain;
    use super::{decode_snapshot, decode_snapshot_tree, inspect_snapshot};

    #[test]
    fn decodes_samples_and_run_metrics_from_nested_snapshot() {
        let root = front_diagonal_snapshot(
            true,
            vec![damage_tag(105, 50)],
            vec![explode_tag(100, 1, 0)],
        );

        let snapshot = decode_snapshot_tree(&root);
        let metrics = snapshot.metrics.expect("Expected run metrics");

        assert_eq!(snapshot.samples_path.as_deref(), Some("data.contents.samples"));
        assert_eq!(snapshot.samples.len(), 10);
        assert_eq!(metrics.pack_version, "1.4");
        assert!(metrics.dragon_died);
        assert_eq!(metrics.last_sample_gt, 1270);
        assert_eq!(metrics.final_gt(), 1600);
        assert_eq!(metrics.end_ticks(), 600);
        assert_eq!(metrics.duration_seconds(), 60.0);
        assert_eq!(metrics.o_level(), Some(48));
        assert_eq!(metrics.explosive_standing_y, Some(101));
        assert_eq!(metrics.beds_exploded, 3);
        assert_eq!(metrics.attributed_damage[0].source, DamageSource::Bed);
        assert_eq!(metrics.bed_damage, 50);
        assert_eq!(metrics.other_damage, 0);
        assert!(!metrics.looks_uninitialized());
    }

    #[test]
    fn halves_anchor_counts_and_drops_empty_explosions() {
        let root = front_diagonal_snapshot(
            false,
            Vec::new(),
            vec![explode_tag(300, 0, 3), explode_tag(200, 0, 0), explode_tag(100, 1, 0)],
        );

        let metrics = decode_snapshot_tree(&root).metrics.expect("Expected run metrics");

        assert_eq!(metrics.explode_events.len(), 2);
        assert_eq!(metrics.explode_events[0].gt, 100);
        assert_eq!(metrics.explode_events[1].anchors, 2);
        assert_eq!(metrics.anchors_exploded, 2);
    }

    #[test]
    fn rescales_hundredfold_damage_and_uses_direct_split() {
        let split_damage = compound(vec![
            ("gt", Tag::Long(500)),
            ("hp_diff_scaled", Tag::Int(4_250)),
            ("bed_dmg_scaled", Tag::Int(4_250)),
        ]);
        let chip = compound(vec![
            ("gt", Tag::Long(520)),
            ("hp_diff_scaled", Tag::Int(150)),
            ("other_dmg_scaled", Tag::Int(150)),
        ]);
        let root = front_diagonal_snapshot(false, vec![chip, split_damage], Vec::new());

        let metrics = decode_snapshot_tree(&root).metrics.expect("Expected run metrics");

        assert_eq!(metrics.damage_scale, 100);
        assert_eq!(metrics.attributed_damage[0].source, DamageSource::Bed);
        assert_eq!(metrics.attributed_damage[0].event.hp_loss, 42);
        assert_eq!(metrics.attributed_damage[1].source, DamageSource::Other);
        assert_eq!(metrics.attributed_damage[1].event.hp_loss, 2);
        assert_eq!(metrics.bed_damage, 42);
        assert_eq!(metrics.other_damage, 2);
        assert_eq!(metrics.damage_events[0].hp_loss, 4_250);
    }

    #[test]
    fn tolerates_missing_sections() {
        let snapshot = decode_snapshot_tree(&compound(vec![("data", compound(Vec::new()))]));
        assert!(snapshot.samples.is_empty());
        assert!(snapshot.metrics.is_none());

        let directory = tempfile::tempdir().expect("Expected temp dir");
        let missing = decode_snapshot(&directory.path().join("absent.dat"));
        assert!(missing.samples_path.is_none());
        assert!(missing.metrics.is_none());
    }

    #[test]
    fn inspects_snapshot_file() {
        let directory = tempfile::tempdir().expect("Expected temp dir");
        let path = directory.path().join("data").join("command_storage_zdash.dat");
        write_snapshot(&path, &front_diagonal_snapshot(true, Vec::new(), Vec::new()));

        let report = inspect_snapshot(&path, Some(directory.path()), &AnvilTerrain, 600, 4)
            .expect("Expected snapshot report");

        assert_eq!(report.sample_count, 10);
        assert_eq!(report.dominant_node, Some(Node::FrontDiag));
        assert_eq!(report.rotation, Rotation::Unknown);
        assert_eq!(report.zero_type, "Front Diagonal Unknown");
        let terrain = report.terrain.expect("Expected terrain section");
        assert!(terrain.iter().all(|entry| entry.ceiling_y.is_none()));

        assert!(inspect_snapshot(&directory.path().join("none.dat"), None, &AnvilTerrain, 600, 4)
            .is_err());
    }
}
