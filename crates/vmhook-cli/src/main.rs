use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "vmhook")]
#[command(about = "Host layout and dispatch diagnostics for vmhook", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work with host layout files
    Layout {
        #[command(subcommand)]
        action: LayoutAction,
    },
    /// Print the event catalogue
    Events {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Compute an indirect call table base offline
    Table {
        /// Address the displacement field is measured from (hex)
        #[arg(long)]
        anchor: String,
        /// Offset of the displacement field from the anchor (hex)
        #[arg(long)]
        displacement_field: String,
        /// Signed displacement read from the field
        #[arg(long, allow_hyphen_values = true)]
        displacement: i32,
        /// Module base, required by the 32-bit formula (hex)
        #[arg(long)]
        base: Option<String>,
        #[arg(long, value_enum, default_value_t = Arch::native())]
        arch: Arch,
        /// Formula addend; the architecture default when omitted
        #[arg(long, allow_hyphen_values = true)]
        addend: Option<i64>,
    },
    /// Calculate the offset between two addresses
    Offset {
        /// Start address (hex)
        from: String,
        /// End address (hex)
        to: String,
    },
}

#[derive(Subcommand)]
enum LayoutAction {
    /// Print a layout with every routine and slot set to zero
    Template {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Print the targets and slots of a layout
    Dump { file: PathBuf },
    /// Validate a layout and list its problems
    Check { file: PathBuf },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
pub enum Arch {
    #[value(name = "32")]
    X86,
    #[value(name = "64")]
    X64,
}

impl Arch {
    fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            Arch::X64
        } else {
            Arch::X86
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vmhook=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Layout { action } => match action {
            LayoutAction::Template { out } => commands::layout::template(out.as_deref()),
            LayoutAction::Dump { file } => commands::layout::dump(&file),
            LayoutAction::Check { file } => commands::layout::check(&file),
        },
        Command::Events { json } => commands::events::run(json),
        Command::Table {
            anchor,
            displacement_field,
            displacement,
            base,
            arch,
            addend,
        } => commands::table::run(commands::table::TableArgs {
            anchor: &anchor,
            displacement_field: &displacement_field,
            displacement,
            base: base.as_deref(),
            arch,
            addend,
        }),
        Command::Offset { from, to } => commands::offset::run(&from, &to),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_table_accepts_negative_displacement() {
        let cli = Cli::try_parse_from([
            "vmhook",
            "table",
            "--anchor",
            "0x1000",
            "--displacement-field",
            "3",
            "--displacement",
            "-16",
            "--arch",
            "32",
        ])
        .unwrap();

        match cli.command {
            Command::Table {
                displacement, arch, ..
            } => {
                assert_eq!(displacement, -16);
                assert_eq!(arch, Arch::X86);
            }
            _ => panic!("expected table command"),
        }
    }
}
