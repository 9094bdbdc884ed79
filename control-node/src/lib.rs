//! Energy- and performance-aware control plane for a small fleet of HTTP
//! backends fronted by a leaf-spine SDN fabric.
//!
//! Two independent loops run on the management node: the scaling controller
//! decides how many backends must be powered on for forecast and observed
//! load, and the path-weight controller balances leaf-to-leaf traffic across
//! redundant spine paths. A front node consumes the published artefacts.

pub mod alerts;
pub mod api;
pub mod config;
pub mod error;
pub mod fleet;
pub mod forecast;
pub mod fsio;
pub mod load;
pub mod pathweights;
pub mod power;
pub mod predictor;
pub mod remote;
pub mod scaling;
pub mod sdn;
pub mod shutdown;
pub mod state;
pub mod telemetry;
pub mod topology;
pub mod usage;

// Re-export commonly used types
pub use alerts::{AlertCategory, AlertLedger, AlertRecord, AlertSeverity};
pub use config::{ControlConfig, WeightMode};
pub use error::{ControlError, Result};
pub use fleet::{FleetState, ServerCapacity, ServerDescriptor, ServerStatus};
pub use forecast::{ForecastCache, ForecastEntry, TierPolicy};
pub use pathweights::{PathWeightController, PathWeightPublication};
pub use scaling::ScalingController;
pub use state::StateStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_imports() {
        let _ = std::any::type_name::<ControlConfig>();
        let _ = std::any::type_name::<FleetState>();
        let _ = std::any::type_name::<PathWeightPublication>();
        let _ = std::any::type_name::<AlertLedger>();
    }
}
