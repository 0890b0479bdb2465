//! Resolution of the reported alarm "type" from a frame's detections.

use crate::detection::Detection;
use std::collections::HashMap;
use tracing::{debug, warn};

/// How the `type` field of an alarm is derived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TypePolicy {
    /// Nothing configured: use the first valid class id
    #[default]
    Unset,
    /// Always report this value
    Fixed(i32),
    /// Explicitly report the first valid class id
    ClassId,
    /// Map class ids to report types, scanning detections in order
    Mapped(HashMap<i32, i32>),
}

/// Resolve the type value for the given detections.
///
/// Never fails; every fallback path logs a warning and lands on a class id
/// or 0.
pub fn resolve_type(policy: &TypePolicy, detections: &[Detection]) -> i32 {
    match policy {
        TypePolicy::Fixed(value) => *value,
        TypePolicy::ClassId => first_valid_class(detections).unwrap_or_else(|| {
            warn!("Class id type policy but no valid detections, falling back to 0");
            0
        }),
        TypePolicy::Mapped(map) => {
            let mapped = detections
                .iter()
                .filter(|d| d.is_valid())
                .find_map(|d| map.get(&d.class_id).map(|t| (d.class_id, *t)));

            if let Some((class_id, resolved)) = mapped {
                debug!(class_id, resolved, "Mapped class id to type");
                return resolved;
            }

            match first_valid_class(detections) {
                Some(class_id) => {
                    warn!(class_id, "No type mapping matched, falling back to class id");
                    class_id
                }
                None => {
                    warn!("Type mapping configured but no valid detections, falling back to 0");
                    0
                }
            }
        }
        TypePolicy::Unset => first_valid_class(detections).unwrap_or_else(|| {
            warn!("No detections and no fixed type, falling back to 0");
            0
        }),
    }
}

fn first_valid_class(detections: &[Detection]) -> Option<i32> {
    detections.iter().find(|d| d.is_valid()).map(|d| d.class_id)
}
