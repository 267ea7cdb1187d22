//! Events command implementation.

use anyhow::Result;
use serde::Serialize;
use strum::IntoEnumIterator;
use vmhook::{EventKind, Phase, Policy, Routine};

#[derive(Debug, Serialize)]
pub struct EventEntry {
    pub kind: EventKind,
    pub phase: Phase,
    pub policy: Policy,
    pub routines: Vec<Routine>,
}

pub fn catalogue() -> Vec<EventEntry> {
    EventKind::iter()
        .map(|kind| EventEntry {
            kind,
            phase: kind.phase(),
            policy: kind.policy(),
            routines: kind.routines().to_vec(),
        })
        .collect()
}

/// What a decision-maker may answer for an event with this policy.
pub fn accepts(policy: &Policy) -> String {
    if policy.is_notification() {
        return "notify".to_string();
    }
    let mut accepted = Vec::new();
    if let Some(payload) = policy.override_with {
        accepted.push(format!("override({payload})"));
    }
    if policy.suppress {
        accepted.push(match policy.suppress_returns {
            Some(payload) => format!("suppress([{payload}])"),
            None => "suppress".to_string(),
        });
    }
    accepted.join(", ")
}

pub fn run(json: bool) -> Result<()> {
    let entries = catalogue();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("{:<18} {:<7} {:<28} Routines", "Event", "Phase", "Accepts");
    println!("{}", "-".repeat(80));
    for entry in &entries {
        let routines: Vec<String> = entry.routines.iter().map(|r| r.to_string()).collect();
        println!(
            "{:<18} {:<7} {:<28} {}",
            entry.kind.to_string(),
            entry.phase.to_string(),
            accepts(&entry.policy),
            routines.join(", ")
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_covers_every_kind() {
        let entries = catalogue();
        assert_eq!(entries.len(), EventKind::iter().count());
    }

    #[test]
    fn test_accepts() {
        assert_eq!(accepts(&EventKind::Frame.policy()), "notify");
        assert_eq!(
            accepts(&EventKind::ClientCommand.policy()),
            "override(text), suppress"
        );
        assert_eq!(accepts(&EventKind::ConsolePrint.policy()), "suppress");
        assert_eq!(
            accepts(&EventKind::ClientConnect.policy()),
            "suppress([text])"
        );
        assert_eq!(
            accepts(&EventKind::ClientThink.policy()),
            "override(user_cmd)"
        );
    }

    #[test]
    fn test_catalogue_serializes() {
        let json = serde_json::to_value(catalogue()).unwrap();
        assert_eq!(json[0]["routines"][0], "G_RunFrame");
    }
}
