use std::f64::consts::PI;

use serde::Serialize;

const COORDINATE_SCALE: f64 = 1000.0;
const MIN_NET_ROTATION_RADIANS: f64 = 0.2;

/// One periodic position reading; coordinates are fixed-point thousandths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub gt: i64,
}

impl Sample {
    fn horizontal(&self) -> (f64, f64) {
        (
            self.x as f64 / COORDINATE_SCALE,
            self.z as f64 / COORDINATE_SCALE,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    BackDiag,
    FrontDiag,
    BackStraight,
    FrontStraight,
}

impl Node {
    /// Fixed ordering; ties in hit counts resolve to the earliest entry.
    pub const ALL: [Node; 4] = [
        Node::BackDiag,
        Node::FrontDiag,
        Node::BackStraight,
        Node::FrontStraight,
    ];

    /// Where the dragon hovers while perching on this node.
    fn sample_anchor(self) -> (f64, f64) {
        match self {
            Node::BackDiag => (-30.0, 27.0),
            Node::FrontDiag => (29.0, -29.0),
            Node::BackStraight => (-21.0, 0.0),
            Node::FrontStraight => (20.0, 0.0),
        }
    }

    /// Block column of the tower that belongs to this node.
    pub fn terrain_anchor(self) -> (i32, i32) {
        match self {
            Node::BackDiag => (-34, 24),
            Node::FrontDiag => (33, -25),
            Node::BackStraight => (-42, -1),
            Node::FrontStraight => (42, 0),
        }
    }

    fn side_label(self) -> &'static str {
        match self {
            Node::FrontDiag | Node::FrontStraight => "Front",
            Node::BackDiag | Node::BackStraight => "Back",
        }
    }

    fn shape_label(self) -> &'static str {
        match self {
            Node::BackDiag | Node::FrontDiag => "Diagonal",
            Node::BackStraight | Node::FrontStraight => "Straight",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rotation {
    #[serde(rename = "cw")]
    Clockwise,
    #[serde(rename = "ccw")]
    CounterClockwise,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Rotation {
    pub fn as_str(self) -> &'static str {
        match self {
            Rotation::Clockwise => "cw",
            Rotation::CounterClockwise => "ccw",
            Rotation::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHitCount {
    pub node: Node,
    pub hits: usize,
}

fn samples_in_window(samples: &[Sample], window_ticks: i64) -> impl Iterator<Item = &Sample> {
    let last_tick = samples
        .first()
        .map(|sample| sample.gt.saturating_add(window_ticks))
        .unwrap_or(i64::MIN);
    samples
        .iter()
        .take_while(move |sample| sample.gt <= last_tick)
}

fn nearest_node(sample: &Sample) -> Node {
    let (x, z) = sample.horizontal();
    let mut best = Node::ALL[0];
    let mut best_distance = f64::INFINITY;
    for node in Node::ALL {
        let (node_x, node_z) = node.sample_anchor();
        let distance = (x - node_x).hypot(z - node_z);
        if distance < best_distance {
            best_distance = distance;
            best = node;
        }
    }
    best
}

pub fn node_hit_counts(samples: &[Sample], window_ticks: i64) -> Vec<NodeHitCount> {
    let mut counts: Vec<NodeHitCount> = Node::ALL
        .iter()
        .map(|node| NodeHitCount {
            node: *node,
            hits: 0,
        })
        .collect();

    for sample in samples_in_window(samples, window_ticks) {
        let node = nearest_node(sample);
        if let Some(entry) = counts.iter_mut().find(|entry| entry.node == node) {
            entry.hits += 1;
        }
    }

    counts
}

pub fn dominant_node(samples: &[Sample], window_ticks: i64) -> Option<Node> {
    if samples.is_empty() {
        return None;
    }

    let mut dominant: Option<&NodeHitCount> = None;
    let counts = node_hit_counts(samples, window_ticks);
    for entry in &counts {
        if dominant.map_or(true, |current| entry.hits > current.hits) {
            dominant = Some(entry);
        }
    }
    dominant.map(|entry| entry.node)
}

fn wrap_angle(mut delta: f64) -> f64 {
    while delta <= -PI {
        delta += 2.0 * PI;
    }
    while delta > PI {
        delta -= 2.0 * PI;
    }
    delta
}

pub fn rotation(samples: &[Sample], window_ticks: i64) -> Rotation {
    let mut previous_angle: Option<f64> = None;
    let mut net = 0.0;

    for sample in samples_in_window(samples, window_ticks) {
        let (x, z) = sample.horizontal();
        let angle = z.atan2(x);
        if let Some(previous) = previous_angle {
            net += wrap_angle(angle - previous);
        }
        previous_angle = Some(angle);
    }

    if net.abs() < MIN_NET_ROTATION_RADIANS {
        Rotation::Unknown
    } else if net > 0.0 {
        Rotation::CounterClockwise
    } else {
        Rotation::Clockwise
    }
}

/// Human label such as `Front Diagonal CW`; `Unknown` without a node.
pub fn zero_type_label(node: Option<Node>, rotation: Rotation) -> String {
    let Some(node) = node else {
        return "Unknown".to_string();
    };
    let direction = match rotation {
        Rotation::Clockwise => "CW",
        Rotation::CounterClockwise => "CCW",
        Rotation::Unknown => "Unknown",
    };
    format!("{} {} {direction}", node.side_label(), node.shape_label())
}
