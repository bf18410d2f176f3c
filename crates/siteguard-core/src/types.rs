use crate::geometry::Rect;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identity reported for faces that do not match any gallery entry.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Class names of the construction-site PPE model, in output index order.
pub const DEFAULT_PPE_CLASSES: [&str; 10] = [
    "Hardhat",
    "Mask",
    "NO-Hardhat",
    "NO-Mask",
    "NO-Safety Vest",
    "Person",
    "Safety Cone",
    "Safety Vest",
    "machinery",
    "vehicle",
];

/// Closed set of labels the alert logic understands.
///
/// Detector implementations translate whatever class-index scheme their
/// model uses into this enum; anything unrecognised becomes `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Hardhat,
    NoHardhat,
    Mask,
    NoMask,
    SafetyVest,
    NoSafetyVest,
    Person,
    SafetyCone,
    Machinery,
    Vehicle,
    Other,
}

impl Label {
    /// Map a raw model class name (`"NO-Safety Vest"`, `"hardhat"`, ...).
    pub fn from_class_name(name: &str) -> Self {
        let normalized: String = name
            .trim()
            .chars()
            .map(|c| match c {
                '-' | '_' => ' ',
                c => c.to_ascii_lowercase(),
            })
            .collect();

        match normalized.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
            "hardhat" | "helmet" | "hard hat" => Label::Hardhat,
            "no hardhat" | "no helmet" | "no hard hat" => Label::NoHardhat,
            "mask" => Label::Mask,
            "no mask" => Label::NoMask,
            "safety vest" | "vest" => Label::SafetyVest,
            "no safety vest" | "no vest" => Label::NoSafetyVest,
            "person" => Label::Person,
            "safety cone" | "cone" => Label::SafetyCone,
            "machinery" => Label::Machinery,
            "vehicle" => Label::Vehicle,
            _ => Label::Other,
        }
    }

    /// Display name used in overlays and summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Hardhat => "Hardhat",
            Label::NoHardhat => "NO-Hardhat",
            Label::Mask => "Mask",
            Label::NoMask => "NO-Mask",
            Label::SafetyVest => "Safety Vest",
            Label::NoSafetyVest => "NO-Safety Vest",
            Label::Person => "Person",
            Label::SafetyCone => "Safety Cone",
            Label::Machinery => "Machinery",
            Label::Vehicle => "Vehicle",
            Label::Other => "Other",
        }
    }
}

/// One labelled detection from the PPE detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub label: Label,
    /// Raw class name as reported by the model.
    pub class_name: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub bbox: Rect,
}

impl DetectionBox {
    pub fn new(class_name: impl Into<String>, confidence: f32, bbox: Rect) -> Self {
        let class_name = class_name.into();
        Self {
            label: Label::from_class_name(&class_name),
            class_name,
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }
}

/// A located face and the best gallery identity for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub bbox: Rect,
    /// Gallery identity, or [`UNKNOWN_IDENTITY`].
    pub identity: String,
    /// Cosine distance to the closest gallery entry; `None` with an empty gallery.
    pub distance: Option<f32>,
}

impl FaceMatch {
    pub fn unknown(bbox: Rect) -> Self {
        Self {
            bbox,
            identity: UNKNOWN_IDENTITY.to_string(),
            distance: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.identity != UNKNOWN_IDENTITY
    }
}

/// Per-frame counts of the labels the alert logic cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ComplianceTally {
    pub hardhats: usize,
    pub vests: usize,
    pub persons: usize,
}

impl ComplianceTally {
    pub fn from_detections(detections: &[DetectionBox]) -> Self {
        detections.iter().fold(Self::default(), |mut tally, det| {
            match det.label {
                Label::Hardhat => tally.hardhats += 1,
                Label::SafetyVest => tally.vests += 1,
                Label::Person => tally.persons += 1,
                _ => {}
            }
            tally
        })
    }

    /// A person is in view and no hardhat was detected anywhere in the frame.
    pub fn is_violation(&self) -> bool {
        self.persons > 0 && self.hardhats == 0
    }

    /// Overlay lines, top to bottom.
    pub fn overlay_lines(&self) -> [String; 3] {
        [
            format!("Hardhats: {}", self.hardhats),
            format!("Vests: {}", self.vests),
            format!("Persons: {}", self.persons),
        ]
    }
}

/// Face bounding box from the face detector, with optional landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]; 0.0 if either vector has zero norm.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// One reference encoding of a known person.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: String,
    /// Image the encoding was computed from.
    pub source: PathBuf,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the closest entry.
    pub similarity: f32,
    /// Identity of the matched entry; `None` unless `matched`.
    pub identity: Option<String>,
}

/// Strategy for comparing a probe embedding against gallery entries.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher.
///
/// The closest entry is only reported as a match if it also clears the
/// threshold; otherwise the probe is unknown.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let best = gallery
            .iter()
            .map(|entry| (entry, probe.similarity(&entry.embedding)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((entry, sim)) if sim >= threshold => MatchResult {
                matched: true,
                similarity: sim,
                identity: Some(entry.identity.clone()),
            },
            Some((_, sim)) => MatchResult {
                matched: false,
                similarity: sim,
                identity: None,
            },
            None => MatchResult {
                matched: false,
                similarity: 0.0,
                identity: None,
            },
        }
    }
}
