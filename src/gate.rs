
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;



/// Capability predicates owned by the licensing collaborator. The core treats each as an opaque bool.
pub trait CapabilityGate : Send + Sync {
    fn can_use_advanced_switching (&self) -> bool;
    fn can_use_custom_hotkeys     (&self) -> bool;
    fn can_use_window_history     (&self) -> bool;
    fn can_use_multiple_displays  (&self) -> bool;
}


#[allow(non_camel_case_types)]
# [ derive (Debug, Default, Eq, PartialEq, Hash, Copy, Clone, AsRefStr, Serialize, Deserialize) ]
#[serde(rename_all = "snake_case")]
/// Explicit override for the capability gate, chosen via config rather than baked into the build
pub enum FeatureGateOverride {
    #[default]
    none,
    force_enabled,
    force_disabled,
}

impl FromStr for FeatureGateOverride {
    type Err = String;
    fn from_str (s: &str) -> Result<Self, Self::Err> {
        match s {
            "none"           => Ok (FeatureGateOverride::none),
            "force_enabled"  => Ok (FeatureGateOverride::force_enabled),
            "force_disabled" => Ok (FeatureGateOverride::force_disabled),
            _ => Err (format! ("unknown feature gate override '{s}'")),
        }
    }
}

impl FeatureGateOverride {
    pub fn str (&self) -> &str { self.as_ref() }

    fn apply (&self, underlying: impl FnOnce() -> bool) -> bool {
        match self {
            FeatureGateOverride::none           => underlying(),
            FeatureGateOverride::force_enabled  => true,
            FeatureGateOverride::force_disabled => false,
        }
    }
}



# [ derive (Debug, Default, Copy, Clone) ]
/// Gate for hosts that ship without a licensing collaborator .. everything stays locked
pub struct NoCapabilities;

impl CapabilityGate for NoCapabilities {
    fn can_use_advanced_switching (&self) -> bool { false }
    fn can_use_custom_hotkeys     (&self) -> bool { false }
    fn can_use_window_history     (&self) -> bool { false }
    fn can_use_multiple_displays  (&self) -> bool { false }
}



# [ derive (Clone) ]
/// Wraps the licensing collaborator's gate with the configured override
pub struct GatedCapabilities {
    underlying : Arc <dyn CapabilityGate>,
    overrides  : FeatureGateOverride,
}

impl GatedCapabilities {
    pub fn new (underlying: Arc<dyn CapabilityGate>, overrides: FeatureGateOverride) -> GatedCapabilities {
        GatedCapabilities { underlying, overrides }
    }
}

impl CapabilityGate for GatedCapabilities {
    fn can_use_advanced_switching (&self) -> bool { self.overrides.apply (|| self.underlying.can_use_advanced_switching()) }
    fn can_use_custom_hotkeys     (&self) -> bool { self.overrides.apply (|| self.underlying.can_use_custom_hotkeys()) }
    fn can_use_window_history     (&self) -> bool { self.overrides.apply (|| self.underlying.can_use_window_history()) }
    fn can_use_multiple_displays  (&self) -> bool { self.overrides.apply (|| self.underlying.can_use_multiple_displays()) }
}
