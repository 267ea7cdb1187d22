//! Layout command implementation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;
use strum::IntoEnumIterator;
use tracing::debug;
use vmhook::{HostLayout, Routine, RoutineGroup, RoutineTarget, SlotMode, load_layout};

pub fn template(out: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(&HostLayout::template())?;
    match out {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Template written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

pub fn dump(file: &Path) -> Result<()> {
    let layout = load(file)?;
    for line in describe(&layout) {
        println!("{}", line);
    }
    Ok(())
}

pub fn check(file: &Path) -> Result<()> {
    let layout = load(file)?;
    let problems = layout.problems();

    if problems.is_empty() {
        println!(
            "{} {} ({} for '{}')",
            "OK".green().bold(),
            file.display(),
            layout.version,
            layout.target_module
        );
        return Ok(());
    }

    println!("{} {}", "INVALID".red().bold(), file.display());
    for problem in &problems {
        println!("  {} {}", "-".red(), problem);
    }
    bail!("{} problem(s) in {}", problems.len(), file.display())
}

fn load(file: &Path) -> Result<HostLayout> {
    debug!("Loading layout {}", file.display());
    load_layout(file).with_context(|| format!("Failed to load layout {}", file.display()))
}

/// Human readable listing of a layout, one routine or slot per line.
pub fn describe(layout: &HostLayout) -> Vec<String> {
    let mut lines = vec![
        format!("Layout:  {}", layout.version),
        format!("Module:  {}", layout.target_module),
        String::new(),
        "Routines:".to_string(),
    ];

    for routine in Routine::iter().filter(|r| r.group() != RoutineGroup::Table) {
        let target = match layout.target(routine) {
            Some(RoutineTarget::Absolute { address }) => format!("0x{:X}", address),
            Some(RoutineTarget::ModuleOffset { offset }) => format!("module+0x{:X}", offset),
            Some(RoutineTarget::AnchorOffset { offset }) => format!("anchor+0x{:X}", offset),
            Some(RoutineTarget::Signature { pattern, scan_len }) => {
                format!("scan 0x{:X} bytes for {}", scan_len, pattern)
            }
            None => "(missing)".to_string(),
        };
        lines.push(format!(
            "  {:<24} {:<9} {}",
            routine.to_string(),
            routine.group().to_string().to_lowercase(),
            target
        ));
    }

    let table = &layout.table;
    let measured_from = table
        .known_routine
        .map(|r| r.to_string())
        .unwrap_or_else(|| "anchor".to_string());
    lines.push(String::new());
    lines.push(format!(
        "Table:   {}+0x{:X} (addend64 {}, addend32 0x{:X})",
        measured_from, table.displacement_offset, table.addend64, table.addend32
    ));
    for (routine, slot) in &table.slots {
        let mode = match slot.mode {
            SlotMode::Replace => "replace",
            SlotMode::Capture => "capture",
        };
        lines.push(format!(
            "  {:<24} {:<9} +0x{:X}",
            routine.to_string(),
            mode,
            slot.offset
        ));
    }

    lines.push(String::new());
    lines.push(match &layout.abi {
        Some(abi) => format!(
            "ABI:     {} clients of 0x{:X} bytes, entities at module+0x{:X}",
            abi.max_clients, abi.client_size, abi.entities
        ),
        None => "ABI:     (none, client events pass through)".to_string(),
    });
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_template_then_check_reports_problems() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("layout.json");

        template(Some(&path)).unwrap();
        let err = check(&path).unwrap_err();
        assert!(err.to_string().contains("problem(s)"));
    }

    #[test]
    fn test_check_missing_file() {
        assert!(check(Path::new("/nonexistent/layout.json")).is_err());
    }

    #[test]
    fn test_describe_lists_every_routine() {
        let layout = HostLayout::template();
        let lines = describe(&layout);

        for routine in Routine::iter() {
            let name = routine.to_string();
            assert!(
                lines.iter().any(|l| l.trim_start().starts_with(&name)),
                "{name} missing"
            );
        }
        assert!(lines.iter().any(|l| l.starts_with("Table:   anchor+0x0")));
        assert!(lines.iter().any(|l| l.contains("capture")));
    }
}
