use std::env;
use std::path::Path;

use hcmod_loader::{ElfView, HostProgram};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <ELF file path>", args[0]);
        std::process::exit(1);
    }

    let file_path = Path::new(&args[1]);
    println!("Parsing ELF file: {}", file_path.display());

    let data = std::fs::read(file_path)?;
    let view = match ElfView::parse(&data) {
        Ok(view) => view,
        Err(e) => {
            eprintln!("Error: failed to parse ELF file: {e}");
            std::process::exit(1);
        }
    };

    println!("machine: {:#x}", view.machine);
    for section in &view.sections {
        println!(
            "section {:>2} {:<20} {:?} offset: {:#x} size: {:#x} [{}]",
            section.index,
            section.name,
            section.kind,
            section.header.sh_offset,
            section.header.sh_size,
            section.perms(),
        );
    }
    for sym in &view.symbols {
        if sym.name.is_empty() {
            continue;
        }
        println!(
            "symbol {} ({}): value {:#x}, section {}",
            rustc_demangle::demangle(&sym.name),
            sym.bind_str(),
            sym.sym.st_value,
            if sym.sym.st_shndx == 0 { "<external>".to_string() } else {
                sym.sym.st_shndx.to_string()
            },
        );
    }
    for reloc in view.exec_relocations.iter().chain(view.rodata_relocations.iter()) {
        println!(
            "reloc: symbol {}, type {:#x}, add: {}, offset: {:#x}",
            view.symbols[reloc.symbol_index].name, reloc.r_type, reloc.addend, reloc.offset,
        );
    }
    println!("kernel functions: {:?}", view.function_names);
    drop(view);

    // Try a full instantiation; external symbols resolve via dlsym only.
    match HostProgram::load(data, &()) {
        Ok(program) => {
            println!("instantiated for {} CPUs", program.instance_count());
        }
        Err(e) => {
            eprintln!("instantiation failed: {e}");
        }
    }
    Ok(())
}
