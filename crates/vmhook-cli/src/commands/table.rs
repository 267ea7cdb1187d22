//! Table command implementation.

use anyhow::{Context, Result, bail};
use vmhook::{BaseRelative, ModuleHandle, RipRelative, TableFormula};

use super::hex_utils::parse_hex_address;
use crate::Arch;

pub struct TableArgs<'a> {
    pub anchor: &'a str,
    pub displacement_field: &'a str,
    pub displacement: i32,
    pub base: Option<&'a str>,
    pub arch: Arch,
    pub addend: Option<i64>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TableBase {
    pub field_address: usize,
    pub table: usize,
    pub module_offset: Option<usize>,
}

pub fn compute(args: &TableArgs) -> Result<TableBase> {
    let anchor = to_usize(parse_hex_address(args.anchor)?)?;
    let field_offset = to_usize(parse_hex_address(args.displacement_field)?)?;
    let base = args
        .base
        .map(|b| parse_hex_address(b).and_then(to_usize))
        .transpose()?;

    let field_address = anchor
        .checked_add(field_offset)
        .context("Displacement field address overflows")?;

    let table = match args.arch {
        Arch::X64 => {
            let formula = args
                .addend
                .map(|addend| RipRelative { addend })
                .unwrap_or_default();
            let module = ModuleHandle::new(base.unwrap_or(0), "", "");
            formula.compute_table_base(&module, field_address, args.displacement)
        }
        Arch::X86 => {
            let Some(base) = base else {
                bail!("--base is required for the 32-bit formula");
            };
            let formula = args
                .addend
                .map(|addend| BaseRelative { addend })
                .unwrap_or_default();
            let module = ModuleHandle::new(base, "", "");
            formula.compute_table_base(&module, field_address, args.displacement)
        }
    }
    .context("Table base falls outside the address space")?;

    Ok(TableBase {
        field_address,
        table,
        module_offset: base.and_then(|b| table.checked_sub(b)),
    })
}

pub fn run(args: TableArgs) -> Result<()> {
    let result = compute(&args)?;

    println!("Formula:      {}", match args.arch {
        Arch::X64 => "displacement + field + addend",
        Arch::X86 => "displacement + addend + module base",
    });
    println!("Field:        0x{:X}", result.field_address);
    println!("Displacement: {}", args.displacement);
    println!();
    println!("Table:        0x{:X}", result.table);
    if let Some(offset) = result.module_offset {
        println!("Module+0x{:X}", offset);
    }

    Ok(())
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).context("Address does not fit this platform")
}
