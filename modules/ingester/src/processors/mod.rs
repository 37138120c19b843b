pub mod asset_damages;
pub mod convoy_compositions;
pub mod unit_events;

pub use asset_damages::AssetDamageProcessor;
pub use convoy_compositions::ConvoyCompositionProcessor;
pub use unit_events::UnitEventProcessor;
