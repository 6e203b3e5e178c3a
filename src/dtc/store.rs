//! J1939 Lookup Store — static (SPN, FMI) -> record table, loaded once.
//!
//! Two tiers: DETAILED (curated, Spanish-language explanations and OEM
//! specific actions) and COMPLETE (generic, FMI-derived severity). Both are
//! loaded from TOML data files at startup into plain `HashMap`s behind an
//! `Arc`, so every truck worker gets cheap, synchronization-free read access.

use crate::types::{J1939Record, Severity};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

type Key = (u32, u8);

#[derive(Debug, Deserialize)]
struct RawRecord {
    spn: u32,
    fmi: u8,
    name: String,
    description_es: String,
    spn_explanation_es: Option<String>,
    fmi_explanation_es: Option<String>,
    severity: Option<String>,
    category: String,
    action: String,
    oem: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawTable {
    #[serde(default)]
    detailed: Vec<RawRecord>,
    #[serde(default)]
    complete: Vec<RawRecord>,
}

fn parse_severity(s: Option<&str>, fmi: u8) -> Severity {
    if let Some(s) = s {
        return match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Severity::Critical,
            "HIGH" => Severity::High,
            "MODERATE" => Severity::Moderate,
            "LOW" => Severity::Low,
            _ => Severity::Info,
        };
    }
    severity_from_fmi(fmi)
}

/// FMI-derived severity banding, spec §4.1 step 2.
pub fn severity_from_fmi(fmi: u8) -> Severity {
    match fmi {
        0 | 1 | 2 | 12 | 14 => Severity::Critical,
        3 | 4 | 5 | 6 | 19 | 20 => Severity::High,
        7..=11 | 13 | 15 | 16 | 21 => Severity::Moderate,
        17 | 18 => Severity::Low,
        _ => Severity::Info,
    }
}

/// Generic action-required template per severity, used when no curated
/// DETAILED record exists (spec §4.1 step 2).
pub fn generic_action_for(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "Detener la unidad de forma segura y contactar a mantenimiento de inmediato.",
        Severity::High => "Programar inspeccion de mantenimiento en las proximas 24 horas.",
        Severity::Moderate => "Monitorear el parametro y programar revision en el proximo servicio.",
        Severity::Low => "Registrar para revision en el siguiente mantenimiento preventivo.",
        Severity::Info => "Sin accion inmediata requerida; informativo.",
    }
}

fn into_record(r: RawRecord) -> (Key, J1939Record) {
    let severity = parse_severity(r.severity.as_deref(), r.fmi);
    let record = J1939Record {
        name: r.name,
        description_es: r.description_es,
        spn_explanation_es: r.spn_explanation_es,
        fmi_explanation_es: r
            .fmi_explanation_es
            .unwrap_or_else(|| format!("FMI {}", r.fmi)),
        severity,
        category: r.category,
        action: r.action,
        oem: r.oem,
    };
    ((r.spn, r.fmi), record)
}

/// Immutable, shared read-only store of J1939 diagnostic records.
#[derive(Debug, Default)]
pub struct J1939Store {
    detailed: HashMap<Key, J1939Record>,
    complete: HashMap<Key, J1939Record>,
}

impl J1939Store {
    /// Load DETAILED + COMPLETE tiers from a TOML file. Missing file or
    /// parse failure yields an empty store (every lookup then falls through
    /// to the decoder's synthesized-unknown path) with a warning logged —
    /// spec §7 treats a missing calibration/data file as a degrade-not-fail
    /// condition.
    pub fn load(path: impl AsRef<Path>) -> Arc<Self> {
        let path = path.as_ref();
        let table = match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<RawTable>(&text) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse J1939 data file, starting empty");
                    RawTable::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "J1939 data file unreadable, starting empty");
                RawTable::default()
            }
        };

        let detailed = table.detailed.into_iter().map(into_record).collect();
        let complete = table.complete.into_iter().map(into_record).collect();
        tracing::info!(
            detailed_count = ?detailed_len(&detailed),
            complete_count = ?detailed_len(&complete),
            "loaded J1939 lookup store"
        );
        Arc::new(Self { detailed, complete })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lookup_detailed(&self, spn: u32, fmi: u8) -> Option<&J1939Record> {
        self.detailed.get(&(spn, fmi))
    }

    pub fn lookup_complete(&self, spn: u32, fmi: u8) -> Option<&J1939Record> {
        self.complete.get(&(spn, fmi))
    }
}

fn detailed_len<T>(m: &HashMap<Key, T>) -> usize {
    m.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmi_severity_buckets_match_spec() {
        assert_eq!(severity_from_fmi(0), Severity::Critical);
        assert_eq!(severity_from_fmi(1), Severity::Critical);
        assert_eq!(severity_from_fmi(2), Severity::Critical);
        assert_eq!(severity_from_fmi(12), Severity::Critical);
        assert_eq!(severity_from_fmi(14), Severity::Critical);
        assert_eq!(severity_from_fmi(3), Severity::High);
        assert_eq!(severity_from_fmi(19), Severity::High);
        assert_eq!(severity_from_fmi(7), Severity::Moderate);
        assert_eq!(severity_from_fmi(21), Severity::Moderate);
        assert_eq!(severity_from_fmi(17), Severity::Low);
        assert_eq!(severity_from_fmi(18), Severity::Low);
        assert_eq!(severity_from_fmi(31), Severity::Info);
    }

    #[test]
    fn empty_store_has_no_matches() {
        let store = J1939Store::empty();
        assert!(store.lookup_detailed(100, 1).is_none());
        assert!(store.lookup_complete(100, 1).is_none());
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("j1939.toml");
        std::fs::write(
            &path,
            r#"
            [[detailed]]
            spn = 100
            fmi = 1
            name = "Engine Oil Pressure"
            description_es = "Presion de aceite del motor baja"
            spn_explanation_es = "Presion de aceite"
            fmi_explanation_es = "Dato bajo, muy bajo"
            severity = "CRITICAL"
            category = "lubrication"
            action = "Detener motor de inmediato"
            oem = "All OEMs"

            [[complete]]
            spn = 157
            fmi = 3
            name = "Injector Metering Rail Pressure"
            description_es = "Presion del riel de inyeccion fuera de rango"
            fmi_explanation_es = "Voltaje/corriente alto"
            category = "fuel_system"
            action = "Revisar en proximo mantenimiento"
            oem = "Generic"
            "#,
        )
        .expect("write");

        let store = J1939Store::load(&path);
        let detailed = store.lookup_detailed(100, 1).expect("present");
        assert_eq!(detailed.severity, Severity::Critical);
        let complete = store.lookup_complete(157, 3).expect("present");
        assert_eq!(complete.severity, Severity::High);
    }
}
