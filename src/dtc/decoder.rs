//! DTC Decoder — parses a Wialon `dtc_string` into ready-to-persist DTC
//! records. Pure and deterministic: no I/O, no panics, malformed input never
//! propagates as an error (spec §4.1).

use super::store::{generic_action_for, severity_from_fmi, J1939Store};
use crate::types::Severity;
use std::collections::HashSet;

/// A decoded token, not yet turned into a full `DtcEvent` (the orchestrator
/// attaches `truck_id`, `timestamp` and dedup/status bookkeeping).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedDtc {
    pub spn: u32,
    pub fmi: u8,
    pub severity: Severity,
    pub category: String,
    pub description_es: String,
    pub spn_explanation_es: Option<String>,
    pub fmi_explanation_es: String,
    pub has_detailed_info: bool,
    pub oem: String,
    pub action_required: String,
}

impl DecodedDtc {
    pub fn dtc_code(&self) -> String {
        format!("{}-{}", self.spn, self.fmi)
    }
}

/// FMI used when a token carries only an SPN with no explicit FMI.
const FMI_UNKNOWN: u8 = 31;

/// Tokens that are no-fault sentinels and must be rejected outright.
fn is_sentinel(token: &str) -> bool {
    matches!(token, "0" | "1" | "0.0" | "1.0")
}

/// Parse one `"<spn>.<fmi>"` or `"<spn>"` token. Returns `None` on any
/// malformed field — the caller skips it silently and keeps going.
fn parse_token(token: &str) -> Option<(u32, u8)> {
    let token = token.trim();
    if token.is_empty() || is_sentinel(token) {
        return None;
    }
    match token.split_once('.') {
        Some((spn_s, fmi_s)) => {
            let spn: u32 = spn_s.trim().parse().ok()?;
            let fmi: u8 = fmi_s.trim().parse().ok()?;
            Some((spn, fmi))
        }
        None => {
            let spn: u32 = token.parse().ok()?;
            Some((spn, FMI_UNKNOWN))
        }
    }
}

/// Decode a comma-separated `dtc_string` into deduplicated, resolved DTC
/// records. Never panics; malformed fields are skipped and logged.
pub fn decode(dtc_string: &str, store: &J1939Store) -> Vec<DecodedDtc> {
    let mut seen: HashSet<(u32, u8)> = HashSet::new();
    let mut out = Vec::new();

    for raw_token in dtc_string.split(',') {
        let raw_token = raw_token.trim();
        if raw_token.is_empty() {
            continue;
        }
        let Some((spn, fmi)) = parse_token(raw_token) else {
            if !is_sentinel(raw_token) && raw_token != "0" {
                tracing::debug!(token = raw_token, "skipping malformed DTC token");
            }
            continue;
        };
        if !seen.insert((spn, fmi)) {
            continue;
        }
        out.push(resolve(spn, fmi, store));
    }

    out
}

fn resolve(spn: u32, fmi: u8, store: &J1939Store) -> DecodedDtc {
    if let Some(record) = store.lookup_detailed(spn, fmi) {
        return DecodedDtc {
            spn,
            fmi,
            severity: record.severity,
            category: record.category.clone(),
            description_es: record.description_es.clone(),
            spn_explanation_es: record.spn_explanation_es.clone(),
            fmi_explanation_es: record.fmi_explanation_es.clone(),
            has_detailed_info: true,
            oem: record.oem.clone(),
            action_required: record.action.clone(),
        };
    }

    if let Some(record) = store.lookup_complete(spn, fmi) {
        let severity = severity_from_fmi(fmi);
        return DecodedDtc {
            spn,
            fmi,
            severity,
            category: record.category.clone(),
            description_es: record.description_es.clone(),
            spn_explanation_es: record.spn_explanation_es.clone(),
            fmi_explanation_es: record.fmi_explanation_es.clone(),
            has_detailed_info: false,
            oem: record.oem.clone(),
            action_required: generic_action_for(severity).to_string(),
        };
    }

    let severity = severity_from_fmi(fmi);
    DecodedDtc {
        spn,
        fmi,
        severity,
        category: "unknown".to_string(),
        description_es: format!("SPN/FMI desconocido ({spn}/{fmi})"),
        spn_explanation_es: None,
        fmi_explanation_es: format!("FMI {fmi}"),
        has_detailed_info: false,
        oem: "Unknown".to_string(),
        action_required: generic_action_for(severity).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::J1939Record;
    use std::sync::Arc;

    fn store_with(detailed: Vec<((u32, u8), J1939Record)>) -> Arc<J1939Store> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("j1939.toml");
        let mut toml = String::new();
        for ((spn, fmi), r) in detailed {
            toml.push_str(&format!(
                "[[detailed]]\nspn = {spn}\nfmi = {fmi}\nname = \"{}\"\ndescription_es = \"{}\"\nfmi_explanation_es = \"{}\"\nseverity = \"CRITICAL\"\ncategory = \"{}\"\naction = \"{}\"\noem = \"{}\"\n\n",
                r.name, r.description_es, r.fmi_explanation_es, r.category, r.action, r.oem
            ));
        }
        std::fs::write(&path, toml).expect("write");
        J1939Store::load(&path)
    }

    #[test]
    fn s5_dtc_stream_scenario() {
        let store = store_with(vec![(
            (100, 1),
            J1939Record {
                name: "Engine Oil Pressure".into(),
                description_es: "Presion de aceite baja".into(),
                spn_explanation_es: Some("Presion de aceite".into()),
                fmi_explanation_es: "Dato muy bajo".into(),
                severity: Severity::Critical,
                category: "lubrication".into(),
                action: "Detener motor".into(),
                oem: "All OEMs".into(),
            },
        )]);

        let decoded = decode("100.1,157.3,0,1", &store);
        assert_eq!(decoded.len(), 2);

        let d100 = decoded.iter().find(|d| d.spn == 100).expect("spn 100");
        assert!(d100.has_detailed_info);
        assert_eq!(d100.severity, Severity::Critical);
        assert_eq!(d100.oem, "All OEMs");

        let d157 = decoded.iter().find(|d| d.spn == 157).expect("spn 157");
        assert!(!d157.has_detailed_info);
        assert_eq!(d157.severity, Severity::High);
    }

    #[test]
    fn rejects_sentinels() {
        let store = J1939Store::empty();
        assert!(decode("0,1,0.0,1.0", &store).is_empty());
    }

    #[test]
    fn spn_without_fmi_defaults_to_unknown() {
        let store = J1939Store::empty();
        let decoded = decode("523.", &store);
        assert!(decoded.is_empty() || decoded[0].fmi == FMI_UNKNOWN);
        let decoded = decode("523", &store);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].fmi, FMI_UNKNOWN);
    }

    #[test]
    fn malformed_token_is_skipped_not_fatal() {
        let store = J1939Store::empty();
        let decoded = decode("abc.def,100.1", &store);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].spn, 100);
    }

    #[test]
    fn duplicate_tokens_collapse() {
        let store = J1939Store::empty();
        let decoded = decode("100.1,100.1,100.1", &store);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn empty_string_yields_empty_result() {
        let store = J1939Store::empty();
        assert!(decode("", &store).is_empty());
    }
}
