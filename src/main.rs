//! Voxelflow CLI - Lazy ROI Dataflow Demo
//!
//! This is a demonstration CLI for the voxelflow library.

use anyhow::{bail, Context, Result};
use ndarray::{ArrayD, IxDyn};
use voxelflow::prelude::*;

fn main() {
    env_logger::init();
    println!("voxelflow v{}", voxelflow::VERSION);
    println!();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        return;
    }

    let result = match args[1].as_str() {
        "demo" => run_demo(&args[2..]),
        "export" => {
            if args.len() < 3 {
                eprintln!("Error: please specify an output directory");
                return;
            }
            run_export(&args[2])
        }
        "help" | "--help" | "-h" => {
            print_usage(&args[0]);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage(&args[0]);
            Ok(())
        }
    };

    if let Err(error) = result {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}

fn print_usage(program: &str) {
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  demo [--size N] [--block N]   Run the lazy pipeline demo");
    println!("  export <dir>                  Demo plus chunk export/import round trip");
    println!("  help                          Show this help message");
}

struct DemoOptions {
    size: usize,
    block: usize,
}

fn parse_options(args: &[String]) -> Result<DemoOptions> {
    let mut options = DemoOptions {
        size: 200,
        block: 25,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--size" if i + 1 < args.len() => {
                options.size = args[i + 1].parse().context("invalid --size")?;
                i += 2;
            }
            "--block" if i + 1 < args.len() => {
                options.block = args[i + 1].parse().context("invalid --block")?;
                i += 2;
            }
            other => bail!("unknown option: {}", other),
        }
    }
    if options.size == 0 || options.block == 0 {
        bail!("--size and --block must be positive");
    }
    Ok(options)
}

fn build_pipeline(
    graph: &Graph,
    size: usize,
    block: usize,
) -> (
    std::sync::Arc<OpArraySource>,
    std::sync::Arc<OpBlockedCache>,
) {
    let values: Vec<f32> = (0..size).map(|i| i as f32).collect();
    let volume = Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[size]), values).expect("ramp volume"));

    let source = OpArraySource::new(graph, volume);
    let scale = OpScale::new(graph, 2.0);
    let cache = OpBlockedCache::new(graph, CacheConfig::new(vec![block]));
    scale
        .input
        .connect(&source.output)
        .expect("wire source -> scale");
    cache
        .input
        .connect(&scale.output)
        .expect("wire scale -> cache");
    (source, cache)
}

fn run_demo(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let graph = Graph::new();
    let (source, cache) = build_pipeline(&graph, options.size, options.block);

    let half = options.size / 2;
    let roi = Roi::new(vec![0], vec![half.max(1)]);

    println!("Reading {} ...", roi);
    cache.output.get(&roi).map_err(|e| anyhow::anyhow!(e))?;
    report(&cache);

    println!("Reading {} again (cache hit) ...", roi);
    cache.output.get(&roi).map_err(|e| anyhow::anyhow!(e))?;
    report(&cache);

    let edit = Roi::new(vec![half / 2], vec![(half / 2 + options.block).min(options.size)]);
    println!("Editing {} ...", edit);
    let patch = Tensor::F32(ArrayD::from_elem(IxDyn(&edit.shape()), -1.0));
    source
        .write_region(&edit, &patch)
        .map_err(|e| anyhow::anyhow!(e))?;

    println!("Reading {} after the edit (partial recompute) ...", roi);
    cache.output.get(&roi).map_err(|e| anyhow::anyhow!(e))?;
    report(&cache);
    Ok(())
}

fn run_export(dir: &str) -> Result<()> {
    let graph = Graph::new();
    let (_, cache) = build_pipeline(&graph, 200, 25);

    let roi = Roi::new(vec![0], vec![200]);
    cache
        .precompute(&roi, None)
        .map_err(|e| anyhow::anyhow!(e))?;
    report(&cache);

    let mut store = DirectoryStore::open(dir)?;
    let tracker = BatchTracker::new(cache.resident_block_count()).with_callback(|update| {
        if let BatchUpdate::BlockCompleted { index, total } = update {
            println!("  exported block {}/{}", index, total);
        }
    });
    let exported = cache.export_blocks(&mut store, Some(&tracker))?;
    println!("Exported {} chunks to {}", exported, store.root().display());

    // Round trip into a fresh cache of identical configuration.
    let graph2 = Graph::new();
    let (_, cache2) = build_pipeline(&graph2, 200, 25);
    let report_import = cache2.import_blocks(&store)?;
    println!(
        "Imported {} chunks ({} stale, {} skipped)",
        report_import.imported, report_import.stale, report_import.skipped
    );

    let original = cache.output.get(&roi).map_err(|e| anyhow::anyhow!(e))?;
    let rehydrated = cache2.output.get(&roi).map_err(|e| anyhow::anyhow!(e))?;
    if original == rehydrated {
        println!("Round trip verified: identical data, no recomputation");
    } else {
        bail!("round trip mismatch");
    }
    Ok(())
}

fn report(cache: &OpBlockedCache) {
    let stats = cache.stats();
    println!(
        "  blocks: {} ({} resident, {} bytes) | hits: {} misses: {} evictions: {} | hit ratio {:.2}",
        cache.block_count(),
        cache.resident_block_count(),
        cache.memory_usage(),
        stats.hits,
        stats.misses,
        stats.evictions,
        stats.hit_ratio()
    );
}
