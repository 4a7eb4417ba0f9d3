use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::index::{DocumentIndex, PlacementRecord};
use crate::request::Position;

/// How a record without a category flag takes part in distance matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsentFlagRule {
    /// Only records that carry a flag are matched by distance.
    #[default]
    Excluded,
    /// Records without a flag are matched by distance like flagged ones.
    Positional,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub absent_flag: AbsentFlagRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Flagged,
    Positional,
    Ineligible,
}

fn bucket(record: &PlacementRecord, config: &ResolverConfig) -> Bucket {
    match record.category_flag {
        Some(flag) if flag != 0 && record.position.is_origin() => Bucket::Flagged,
        Some(_) => Bucket::Positional,
        None => match config.absent_flag {
            AbsentFlagRule::Positional => Bucket::Positional,
            AbsentFlagRule::Excluded => Bucket::Ineligible,
        },
    }
}

/// Which rule picked the record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Sentinel-positioned record selected by its category flag.
    Flagged { category_flag: u8 },
    /// Nearest distance-eligible record.
    Nearest { distance: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct Match<'a> {
    pub record: &'a PlacementRecord,
    pub kind: MatchKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("no eligible placement of {class_name} for target {target} ({candidates} record(s) with that class)")]
pub struct NoCandidate {
    pub class_name: String,
    pub target: Position,
    pub candidates: usize,
}

/// Pick the single record a request for `class_name` near `target` means.
///
/// Flag-identified sentinel records (non-zero category flag at the origin)
/// win outright, first in document order. Otherwise the nearest of the
/// remaining flagged records is chosen; ties go to the earlier record.
pub fn resolve<'a>(
    index: &'a DocumentIndex,
    class_name: &str,
    target: Position,
    config: &ResolverConfig,
) -> Result<Match<'a>, NoCandidate> {
    let mut candidates = 0usize;
    let mut flagged: Option<&PlacementRecord> = None;
    let mut nearest: Option<(&PlacementRecord, f64)> = None;

    for record in index.candidates(class_name) {
        candidates += 1;
        let distance = record.position.distance(&target);
        let bucket = bucket(record, config);

        debug!(
            candidate = candidates,
            class = class_name,
            x = record.position.x,
            y = record.position.y,
            z = record.position.z,
            distance,
            category_flag = ?record.category_flag,
            bucket = ?bucket,
            "Placement candidate"
        );

        match bucket {
            Bucket::Flagged => {
                flagged.get_or_insert(record);
            }
            Bucket::Positional => {
                if nearest.map_or(true, |(_, best)| distance < best) {
                    nearest = Some((record, distance));
                }
            }
            Bucket::Ineligible => {}
        }
    }

    if let Some(record) = flagged {
        return Ok(Match {
            record,
            kind: MatchKind::Flagged {
                category_flag: record.category_flag.unwrap_or_default(),
            },
        });
    }

    match nearest {
        Some((record, distance)) => Ok(Match {
            record,
            kind: MatchKind::Nearest { distance },
        }),
        None => Err(NoCandidate {
            class_name: class_name.to_string(),
            target,
            candidates,
        }),
    }
}
