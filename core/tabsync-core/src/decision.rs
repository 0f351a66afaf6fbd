//! Per-product tracking decisions.

use std::sync::Arc;

use rand::Rng;

/// Stored value of a sampled product that tracks the session.
pub const TRACKED: &str = "1";
/// Stored value of a sampled product that opted out of this session.
pub const NOT_TRACKED: &str = "0";

/// A product's choice for the current session.
///
/// `tracking_type` is what gets stored under the product key; it is handed
/// back to the decision callback as the prior value on the next evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingDecision {
    pub is_tracked: bool,
    pub tracking_type: String,
}

impl TrackingDecision {
    pub fn tracked(tracking_type: impl Into<String>) -> Self {
        TrackingDecision {
            is_tracked: true,
            tracking_type: tracking_type.into(),
        }
    }

    pub fn not_tracked(tracking_type: impl Into<String>) -> Self {
        TrackingDecision {
            is_tracked: false,
            tracking_type: tracking_type.into(),
        }
    }
}

/// Decision callback. Receives the raw value stored under the product key,
/// which may be absent or something this product never wrote.
pub type ComputeDecision = Arc<dyn Fn(Option<&str>) -> TrackingDecision + Send + Sync>;

/// Keeps a valid prior decision, otherwise samples `sample_rate` percent of
/// sessions in.
pub fn sampled(
    sample_rate: f64,
) -> impl Fn(Option<&str>) -> TrackingDecision + Send + Sync + 'static {
    move |prior: Option<&str>| match prior {
        Some(TRACKED) => TrackingDecision::tracked(TRACKED),
        Some(NOT_TRACKED) => TrackingDecision::not_tracked(NOT_TRACKED),
        _ => {
            if rand::thread_rng().gen::<f64>() * 100.0 < sample_rate {
                TrackingDecision::tracked(TRACKED)
            } else {
                TrackingDecision::not_tracked(NOT_TRACKED)
            }
        }
    }
}
