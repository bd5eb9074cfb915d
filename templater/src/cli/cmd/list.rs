use console::Style;
use std::process::ExitCode;

use super::GlobalArgs;

pub fn run(cmd: super::Commands, global: &GlobalArgs) -> ExitCode {
    match cmd {
        super::Commands::List {} => {
            let catalog = global.load_catalog();
            if catalog.is_empty() {
                eprintln!(
                    "No templates found. Please ensure {} exists and is valid.",
                    global.catalog.display()
                );
                return ExitCode::FAILURE;
            }

            let name_style = Style::new().bold();
            let dim = Style::new().dim();

            println!("Available images:");
            for (name, entry) in catalog.iter() {
                println!(
                    "  {}: {} (ID: {})",
                    name_style.apply_to(name),
                    entry.vm_name,
                    entry.vm_id
                );
                println!(
                    "    Description: {}",
                    entry
                        .description
                        .as_deref()
                        .unwrap_or("No description available")
                );
                println!("    URL: {}", dim.apply_to(&entry.url));
                println!();
            }

            for (name, reason) in catalog.rejected() {
                println!("  {}: invalid entry", name_style.apply_to(name));
                println!("    {}", dim.apply_to(reason));
                println!();
            }
            ExitCode::SUCCESS
        }
        _ => unreachable!("list::run requires Commands::List"),
    }
}
