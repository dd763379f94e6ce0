//! PBAC (Pictorial Blood Assessment Chart) day scoring.
//!
//! Scores follow the Higham chart:
//! - Pads score 1/5/20 and tampons 1/5/10 for light/medium/heavy fill
//! - Small clots score 1, large clots 5
//! - Each flooding episode scores 5, capped at 6 episodes per day
//! - Menstrual cup volume is tracked but never scored

use crate::{
    AbsentReason, ClotSize, Error, FillLevel, PbacRecord, Product, ProductKind, Result,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default rules, built once and shared
static STANDARD_RULES: Lazy<PbacRules> = Lazy::new(PbacRules::default);

/// Scoring weights and cycle thresholds
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PbacRules {
    /// Pad weights indexed by light/medium/heavy
    pub pad_weights: [u32; 3],
    /// Tampon weights indexed by light/medium/heavy
    pub tampon_weights: [u32; 3],
    pub clot_small_points: u32,
    pub clot_large_points: u32,
    pub flooding_points_per_episode: u32,
    pub max_flooding_episodes_per_day: u32,
    /// Highest score still counted as spotting
    pub spotting_max: u32,
    /// Lowest score counted as a bleeding day
    pub bleeding_min: u32,
    /// Zero days required before a bleed starts a new cycle
    pub min_zeros_before_new_bleed: u32,
    pub cup_max_ml: u32,
}

impl Default for PbacRules {
    fn default() -> Self {
        Self {
            pad_weights: [1, 5, 20],
            tampon_weights: [1, 5, 10],
            clot_small_points: 1,
            clot_large_points: 5,
            flooding_points_per_episode: 5,
            max_flooding_episodes_per_day: 6,
            spotting_max: 4,
            bleeding_min: 5,
            min_zeros_before_new_bleed: 2,
            cup_max_ml: 120,
        }
    }
}

impl PbacRules {
    /// Shared reference to the default rules
    pub fn standard() -> &'static PbacRules {
        &STANDARD_RULES
    }

    /// Weight of one product at the given fill level
    pub fn product_weight(&self, kind: ProductKind, fill: FillLevel) -> u32 {
        let table = match kind {
            ProductKind::Pad => &self.pad_weights,
            ProductKind::Tampon => &self.tampon_weights,
        };
        table[fill.index()]
    }

    pub fn clot_points(&self, clots: ClotSize) -> u32 {
        match clots {
            ClotSize::None => 0,
            ClotSize::Small => self.clot_small_points,
            ClotSize::Large => self.clot_large_points,
        }
    }

    /// Check that the thresholds describe a usable classification
    pub fn validate(&self) -> Result<()> {
        if self.spotting_max >= self.bleeding_min {
            return Err(Error::Config(format!(
                "pbac.spotting_max ({}) must be below pbac.bleeding_min ({})",
                self.spotting_max, self.bleeding_min
            )));
        }
        if self.bleeding_min == 0 {
            return Err(Error::Config("pbac.bleeding_min must be positive".into()));
        }
        Ok(())
    }
}

/// Compute a day's PBAC score
///
/// Returns `None` when the day is marked absent. Otherwise the score is the
/// sum of product weights, clamped flooding episodes and clot points.
pub fn compute_day_score(record: &PbacRecord, rules: &PbacRules) -> Option<u32> {
    if record.absent_reason.is_some() {
        return None;
    }

    let products: u32 = record
        .products
        .iter()
        .map(|p| rules.product_weight(p.kind, p.fill))
        .sum();
    let episodes = record
        .flooding_episodes
        .min(rules.max_flooding_episodes_per_day);

    Some(products + episodes * rules.flooding_points_per_episode + rules.clot_points(record.clots))
}

impl PbacRecord {
    /// Build a scored record from a day's inputs
    pub fn from_inputs(
        products: impl IntoIterator<Item = Product>,
        clots: ClotSize,
        flooding_episodes: u32,
        cup_ml: u32,
        rules: &PbacRules,
    ) -> Self {
        let mut record = Self {
            products: dedupe_products(products),
            clots,
            flooding_episodes: flooding_episodes.min(rules.max_flooding_episodes_per_day),
            cup_ml: cup_ml.min(rules.cup_max_ml),
            period_start: false,
            day_score: None,
            absent_reason: None,
        };
        record.recompute(rules);
        record
    }

    /// A record with no inputs, explicitly marked absent
    pub fn absent(reason: AbsentReason) -> Self {
        Self {
            absent_reason: Some(reason),
            ..Self::default()
        }
    }

    /// Mark the day period start
    pub fn with_period_start(mut self, period_start: bool) -> Self {
        self.period_start = period_start;
        self
    }

    /// Clear all inputs and mark the day absent
    pub fn mark_absent(&mut self, reason: AbsentReason) {
        *self = Self {
            period_start: self.period_start,
            ..Self::absent(reason)
        };
    }

    /// Replace the day's inputs, clearing any absent marker
    pub fn set_inputs(
        &mut self,
        products: impl IntoIterator<Item = Product>,
        clots: ClotSize,
        flooding_episodes: u32,
        cup_ml: u32,
        rules: &PbacRules,
    ) {
        *self = Self {
            period_start: self.period_start,
            ..Self::from_inputs(products, clots, flooding_episodes, cup_ml, rules)
        };
    }

    /// Recompute `day_score` from the other fields
    pub fn recompute(&mut self, rules: &PbacRules) {
        self.day_score = compute_day_score(self, rules);
    }
}

/// Keep the first product of each kind
fn dedupe_products(products: impl IntoIterator<Item = Product>) -> Vec<Product> {
    let mut kept: Vec<Product> = Vec::new();
    for product in products {
        if !kept.iter().any(|p| p.kind == product.kind) {
            kept.push(product);
        }
    }
    kept
}

fn parse_fill(value: Option<&Value>) -> Option<FillLevel> {
    match value.and_then(Value::as_str) {
        Some("none") => None,
        Some("medium") | Some("mid") => Some(FillLevel::Medium),
        Some("heavy") | Some("high") => Some(FillLevel::Heavy),
        _ => Some(FillLevel::Light),
    }
}

fn parse_kind(value: Option<&Value>) -> Option<ProductKind> {
    match value.and_then(Value::as_str) {
        Some("pad") => Some(ProductKind::Pad),
        Some("tampon") => Some(ProductKind::Tampon),
        _ => None,
    }
}

fn parse_clots(value: Option<&Value>) -> ClotSize {
    match value.and_then(Value::as_str) {
        Some("small") => ClotSize::Small,
        Some("large") => ClotSize::Large,
        _ => ClotSize::None,
    }
}

fn parse_absent(value: Option<&Value>) -> Option<AbsentReason> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            serde_json::from_value::<AbsentReason>(v.clone()).unwrap_or(AbsentReason::Unknown),
        ),
    }
}

fn as_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn clamp_count(n: f64, max: u32) -> u32 {
    n.clamp(0.0, f64::from(max)) as u32
}

/// Normalize a persisted PBAC value of any vintage into a scored record
///
/// Accepts fill aliases (`low`/`mid`/`high`), the legacy boolean `flooding`
/// flag, stringly numbers, and unknown products or clot sizes, and always
/// recomputes the day score.
pub fn normalize_pbac(raw: &Value, rules: &PbacRules) -> PbacRecord {
    let Some(obj) = raw.as_object() else {
        return PbacRecord::default();
    };

    let products = obj
        .get("products")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|p| {
                    let kind = parse_kind(p.get("kind"))?;
                    let fill = parse_fill(p.get("fill"))?;
                    Some(Product { kind, fill })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let episodes = match obj.get("floodingEpisodes") {
        Some(v) if !v.is_null() => as_number(Some(v)),
        _ => None,
    }
    .unwrap_or_else(|| match obj.get("flooding") {
        Some(Value::Bool(true)) => 1.0,
        _ => 0.0,
    });

    let cup_ml = as_number(obj.get("cupMl")).unwrap_or(0.0).round();

    let mut record = PbacRecord {
        products: dedupe_products(products),
        clots: parse_clots(obj.get("clots")),
        flooding_episodes: clamp_count(episodes, rules.max_flooding_episodes_per_day),
        cup_ml: clamp_count(cup_ml, rules.cup_max_ml),
        period_start: obj
            .get("periodStart")
            .map(|v| match v {
                Value::Bool(b) => *b,
                Value::Null => false,
                Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
                Value::String(s) => !s.is_empty(),
                _ => true,
            })
            .unwrap_or(false),
        day_score: None,
        absent_reason: parse_absent(obj.get("absent_reason")),
    };
    record.recompute(rules);
    record
}

impl From<Value> for PbacRecord {
    fn from(raw: Value) -> Self {
        normalize_pbac(&raw, PbacRules::standard())
    }
}
