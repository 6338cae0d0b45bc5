//! swemu: binary-container inspector for the emulation shim.

use std::env;

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use swemu::xclbin::{Connectivity, MemTopology, SectionKind, Xclbin};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(path) = args.get(1).filter(|a| !a.starts_with('-')) else {
        bail!("usage: swemu <image.xclbin>");
    };

    println!("Loading: {}", path);
    println!();

    let file = std::fs::File::open(path).with_context(|| format!("opening {path}"))?;
    let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("mapping {path}"))?;
    let xclbin = Xclbin::parse(&mmap)?;

    println!("Container Summary");
    println!("=================");
    println!("UUID: {}", xclbin.uuid());
    println!("Platform: {}", xclbin.platform());
    println!("Sections: {}", xclbin.num_sections());
    println!();

    for (i, section) in xclbin.sections().enumerate() {
        println!(
            "  [{:2}] {:?} \"{}\" @ {:#x}, {} bytes",
            i,
            section.kind,
            section.name,
            section.offset,
            section.size()
        );
    }

    if let Some(section) = xclbin.memory_topology_section() {
        println!();
        println!("Memory Topology");
        println!("===============");
        match MemTopology::parse(section.data) {
            Ok(topology) => {
                for (i, row) in topology.rows().iter().enumerate() {
                    println!(
                        "  [{:2}] {:?} \"{}\" used={} base/flow={:#x}",
                        i,
                        row.kind(),
                        row.tag(),
                        row.used,
                        row.base_or_flow
                    );
                }
            }
            Err(e) => println!("  Warning: failed to parse topology: {}", e),
        }
    }

    if let Some(section) = xclbin.find_section(SectionKind::Connectivity) {
        println!();
        println!("Connectivity");
        println!("============");
        match Connectivity::parse(section.data) {
            Ok(connectivity) => {
                for (i, row) in connectivity.rows().iter().enumerate() {
                    println!(
                        "  [{:2}] arg {} of ip {} -> mem row {}",
                        i, row.arg_index, row.ip_layout_index, row.mem_data_index
                    );
                }
            }
            Err(e) => println!("  Warning: failed to parse connectivity: {}", e),
        }
    }

    Ok(())
}
