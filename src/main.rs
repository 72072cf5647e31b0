use std::fs::File;
use std::io::{BufReader, BufWriter, Write};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use synapse_cache::observer::AcceleratorAdapter;
use synapse_cache::prelude::{Accelerator, AcceleratorConfig, GraphConfig, MemoryConfig, Vocabulary};

const PAIRS: [(&str, &str); 5] = [
    ("hello", "world"),
    ("good", "morning"),
    ("thank", "you"),
    ("how", "are"),
    ("see", "later"),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        None | Some("demo") => {
            run_demo(None)?;
        }
        Some("save") => {
            let Some(path) = args.get(2) else {
                print_help();
                std::process::exit(2);
            };
            run_demo(Some(path.as_str()))?;
        }
        Some("inspect") => {
            let Some(path) = args.get(2) else {
                print_help();
                std::process::exit(2);
            };
            inspect(path)?;
        }
        Some("--help" | "-h" | "help") => print_help(),
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(2);
        }
    }
    Ok(())
}

fn print_help() {
    println!("synapse-cache (pathway-cached selective inference demo)");
    println!("usage:");
    println!("  synapse-cache [demo]");
    println!("  synapse-cache save <image>");
    println!("  synapse-cache inspect <image>");
    println!("  synapse-cache --help");
    println!();
    println!("Set RUST_LOG=debug to see forgetting sweeps.");
}

fn run_demo(save_to: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let mut prompts = Vocabulary::new(32);
    let mut replies = Vocabulary::new(10);
    for (p, r) in PAIRS {
        prompts.intern(p)?;
        replies.intern(r)?;
    }

    let mut acc = Accelerator::from_configs(
        GraphConfig::default().with_seed(42),
        MemoryConfig::default().with_exploration(0.0, 0.05),
        AcceleratorConfig::default(),
    )?;

    let mut lr = 0.1;
    for epoch in 0..20 {
        let mut loss = 0.0;
        for (p, r) in PAIRS {
            let target = replies.index_of(r).ok_or("reply not interned")?;
            loss += acc.train_step(&prompts.encode(p), target, lr, "train")?;
        }
        if epoch % 5 == 4 {
            info!(epoch = epoch + 1, loss = loss / PAIRS.len() as f32, lr, "training");
        }
        lr *= 0.9;
    }

    acc.configure(20, 0.0)?;
    println!("prompt      dense       selective");
    for (p, r) in PAIRS {
        let x = prompts.encode(p);
        let dense = acc.graph_mut().forward(&x)?;
        let fast = acc.fast_inference(&x)?;
        let dense_word = replies.decode(&dense).unwrap_or("?");
        let fast_word = replies.decode(&fast).unwrap_or("?");
        if dense_word != r {
            warn!(prompt = p, expected = r, got = dense_word, "pair not learned");
        }
        println!("{p:<11} {dense_word:<11} {fast_word}");
    }

    let report = acc.run_benchmark(&prompts.encode("hello"), 1000)?;
    println!();
    println!(
        "benchmark: dense {:?}, selective {:?}, speedup {:.2}x, sparsity {:.1}%",
        report.dense,
        report.selective,
        report.speedup,
        report.sparsity * 100.0
    );

    let summary = acc.memory().consolidate();
    println!(
        "memory: {} recorded, {} episodes, {} strong pathways",
        summary.recorded_accesses,
        summary.episode_count,
        summary.strong_pathways.len()
    );
    for s in summary.strong_pathways.iter().take(5) {
        println!(
            "  {} -> {}  strength {:.3}  accesses {}",
            s.source, s.target, s.strength, s.access_count
        );
    }

    if let Some(path) = save_to {
        let mut w = BufWriter::new(File::create(path)?);
        acc.save_image_to(&mut w)?;
        w.flush()?;
        info!(path, "image saved");
    }
    Ok(())
}

fn inspect(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut r = BufReader::new(File::open(path)?);
    let acc = Accelerator::load_image_from(&mut r)?;
    let snap = AcceleratorAdapter::new(&acc).snapshot();

    println!("{:#?}", snap.stats);
    println!("{:#?}", snap.graph);
    println!(
        "memory: sequence {}, {} pathways, {} history records",
        snap.memory.sequence, snap.memory.pathway_count, snap.memory.history_len
    );
    for (source, target, score) in snap.ranked.iter().take(10) {
        println!("  {source} -> {target}  score {score:.4}");
    }
    Ok(())
}
