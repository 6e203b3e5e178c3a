//! Truck Registry (spec §6): the authoritative list of trucks this core is
//! allowed to process, loaded once from TOML and wrapped in `ArcSwap` so an
//! operator can push an updated file without restarting the scheduler.

use crate::types::Truck;
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct RawTruck {
    truck_id: String,
    tank_capacity_gal: f64,
    baseline_mpg: f64,
    #[serde(default)]
    refuel_factor: Option<f64>,
    #[serde(default)]
    biodiesel_blend_fraction: Option<f64>,
    #[serde(default = "default_true")]
    is_allowed: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
struct RawRegistry {
    #[serde(default)]
    truck: Vec<RawTruck>,
}

fn into_truck(raw: RawTruck) -> Truck {
    Truck {
        truck_id: raw.truck_id,
        tank_capacity_gal: raw.tank_capacity_gal,
        baseline_mpg: raw.baseline_mpg,
        refuel_factor: raw.refuel_factor,
        biodiesel_blend_fraction: raw.biodiesel_blend_fraction,
        is_allowed: raw.is_allowed,
    }
}

/// Hot-reloadable registry of known trucks. Every worker holds a cheap
/// `Arc` clone via `load()`; a reload only affects lookups issued after it
/// completes, never a consistent snapshot of the whole fleet.
pub struct TruckRegistry {
    trucks: ArcSwap<Vec<Truck>>,
}

impl TruckRegistry {
    pub fn empty() -> Self {
        Self { trucks: ArcSwap::from_pointee(Vec::new()) }
    }

    /// Load from a TOML file. Missing/unparsable file yields an empty
    /// registry with a warning, matching the J1939 store's degrade-not-fail
    /// behavior for optional static data.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<RawRegistry>(&text) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse truck registry, starting empty");
                    RawRegistry::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "truck registry file unreadable, starting empty");
                RawRegistry::default()
            }
        };
        let trucks: Vec<Truck> = raw.truck.into_iter().map(into_truck).collect();
        tracing::info!(count = trucks.len(), "loaded truck registry");
        Self { trucks: ArcSwap::from_pointee(trucks) }
    }

    /// Atomically replace the registry contents with a freshly loaded file
    /// — the hot-reload path.
    pub fn reload(&self, path: impl AsRef<Path>) {
        let fresh = Self::load(path);
        self.trucks.store(fresh.trucks.load_full());
    }

    pub fn lookup(&self, truck_id: &str) -> Option<Truck> {
        self.trucks.load().iter().find(|t| t.truck_id == truck_id).cloned()
    }

    pub fn all(&self) -> Vec<Truck> {
        self.trucks.load().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.trucks.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TruckRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_empty_registry() {
        let registry = TruckRegistry::load("/nonexistent/path/registry.toml");
        assert!(registry.is_empty());
    }

    #[test]
    fn loads_trucks_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [[truck]]
            truck_id = "TRK-001"
            tank_capacity_gal = 120.0
            baseline_mpg = 6.2
            "#
        )
        .unwrap();
        let registry = TruckRegistry::load(file.path());
        assert_eq!(registry.len(), 1);
        let truck = registry.lookup("TRK-001").expect("truck present");
        assert!((truck.tank_capacity_gal - 120.0).abs() < 1e-9);
        assert!(truck.is_allowed);
    }

    #[test]
    fn reload_replaces_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"[[truck]]
truck_id = "TRK-001"
tank_capacity_gal = 120.0
baseline_mpg = 6.2
"#)
        .unwrap();
        let registry = TruckRegistry::load(file.path());
        assert_eq!(registry.len(), 1);

        let mut file2 = std::fs::File::create(file.path()).unwrap();
        writeln!(file2, r#"[[truck]]
truck_id = "TRK-001"
tank_capacity_gal = 120.0
baseline_mpg = 6.2

[[truck]]
truck_id = "TRK-002"
tank_capacity_gal = 150.0
baseline_mpg = 5.8
"#)
        .unwrap();
        registry.reload(file.path());
        assert_eq!(registry.len(), 2);
    }
}
