//! Minimal CLI over the memory ledger primitives.
//!
//! Hashes JSON documents, builds Merkle roots and inclusion proofs over sets of
//! documents, checks proofs, and runs an in-memory submit/verify demo.

use std::{env, fs, path::Path};

use memory_ledger::{
    hash_value, Digest, LedgerConfig, MemoryLedger, MemoryRecord, MerkleNode, MerkleTree, Proof,
};
use tracing_subscriber::EnvFilter;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn print_help() {
    println!("Usage: memledger <hash|root|prove|verify-proof|demo> ...");
    println!("  hash <file.json>");
    println!("  root <file.json>... [--tree]");
    println!("  prove <leaf_index> <file.json>... [--output <proof.json>]");
    println!("  verify-proof <proof.json> [--root <hex>]");
    println!("  demo [config.json]");
    println!();
    println!("Log level: MEMLEDGER_LOG or RUST_LOG (default info).");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MEMLEDGER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let mut args = env::args().skip(1);
    let command = args.next();
    match command.as_deref() {
        Some("hash") => cmd_hash(args.collect()),
        Some("root") => cmd_root(args.collect()),
        Some("prove") => cmd_prove(args.collect()),
        Some("verify-proof") => cmd_verify_proof(args.collect()),
        Some("demo") => cmd_demo(args.collect()),
        Some("-h") | Some("--help") => print_help(),
        _ => {
            print_help();
            std::process::exit(1);
        }
    }
}

fn read_json(path: &Path) -> serde_json::Value {
    let text = fs::read_to_string(path)
        .unwrap_or_else(|err| fatal(&format!("failed to read {}: {err}", path.display())));
    serde_json::from_str(&text)
        .unwrap_or_else(|err| fatal(&format!("invalid JSON in {}: {err}", path.display())))
}

fn content_digest(path: &Path) -> Digest {
    let outcome = hash_value(&read_json(path));
    if !outcome.cryptographically_sound {
        fatal(&format!("{} could not be canonicalized", path.display()));
    }
    outcome.digest
}

fn tree_from_files(files: &[String]) -> MerkleTree {
    if files.is_empty() {
        fatal("at least one file is required");
    }
    MerkleTree::from_digests(files.iter().map(|file| content_digest(Path::new(file))))
}

fn cmd_hash(args: Vec<String>) {
    if args.len() != 1 {
        fatal("Usage: memledger hash <file.json>");
    }
    let outcome = hash_value(&read_json(Path::new(&args[0])));
    println!("digest: {}", outcome.digest);
    println!("cryptographically_sound: {}", outcome.cryptographically_sound);
}

fn cmd_root(args: Vec<String>) {
    let show_tree = args.iter().any(|arg| arg == "--tree");
    let files: Vec<String> = args.into_iter().filter(|arg| arg != "--tree").collect();
    let tree = tree_from_files(&files);
    let root = tree.root().unwrap_or_else(|| fatal("tree has no root"));
    println!("root: {root}");
    println!("leaves: {}", tree.len());
    println!("depth: {}", tree.depth());
    for (idx, leaf) in tree.leaves().iter().enumerate() {
        println!("  [{idx}] {} {}", leaf.digest, files[idx]);
    }
    if show_tree {
        if let Some(node) = tree.root_node() {
            print_node(node, 0);
        }
    }
}

fn print_node(node: &MerkleNode, level: usize) {
    let indent = "  ".repeat(level);
    match node {
        MerkleNode::Leaf { digest, index } => println!("{indent}leaf[{index}] {digest}"),
        MerkleNode::Internal { digest, left, right } => {
            println!("{indent}node {digest}");
            print_node(left, level + 1);
            print_node(right, level + 1);
        }
    }
}

fn cmd_prove(args: Vec<String>) {
    let mut iter = args.into_iter();
    let index: usize = iter
        .next()
        .unwrap_or_else(|| fatal("Usage: memledger prove <leaf_index> <file.json>..."))
        .parse()
        .unwrap_or_else(|_| fatal("invalid leaf index"));
    let mut files = Vec::new();
    let mut output: Option<String> = None;
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--output" => {
                output = Some(
                    iter.next()
                        .unwrap_or_else(|| fatal("--output expects a path")),
                );
            }
            _ => files.push(arg),
        }
    }
    let tree = tree_from_files(&files);
    let leaf = tree
        .leaves()
        .get(index)
        .unwrap_or_else(|| fatal("leaf index out of bounds"));
    let proof = tree
        .generate_proof(&leaf.digest)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    let json = proof
        .to_json_string()
        .unwrap_or_else(|err| fatal(&err.to_string()));
    match output {
        Some(path) => {
            if let Err(err) = fs::write(&path, json) {
                fatal(&format!("failed to write proof: {err}"));
            }
            println!("proof for leaf {index} written to {path}");
        }
        None => println!("{json}"),
    }
}

fn cmd_verify_proof(args: Vec<String>) {
    let mut iter = args.into_iter();
    let path = iter
        .next()
        .unwrap_or_else(|| fatal("Usage: memledger verify-proof <proof.json> [--root <hex>]"));
    let mut expected_root: Option<Digest> = None;
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--root" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--root expects a value"));
                expected_root =
                    Some(Digest::parse(&value).unwrap_or_else(|err| fatal(&err.to_string())));
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let text = fs::read_to_string(&path)
        .unwrap_or_else(|err| fatal(&format!("failed to read proof file: {err}")));
    let proof = Proof::from_json_str(&text).unwrap_or_else(|err| fatal(&err.to_string()));
    if let Some(root) = &expected_root {
        if root != &proof.root {
            fatal("proof root does not match expected root");
        }
    }
    if !proof.verify() {
        fatal("invalid Merkle proof");
    }
    println!(
        "Proof verified for leaf {} (index {}) under root {}.",
        proof.leaf, proof.index, proof.root
    );
}

fn cmd_demo(args: Vec<String>) {
    let config = match args.first() {
        Some(path) => LedgerConfig::from_path(Path::new(path)),
        None => Ok(LedgerConfig::default()),
    }
    .and_then(LedgerConfig::apply_env_overrides)
    .unwrap_or_else(|err| fatal(&err.to_string()));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")));
    runtime.block_on(async move {
        let (ledger, store) =
            MemoryLedger::in_memory(config).unwrap_or_else(|err| fatal(&err.to_string()));
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut walk = MemoryRecord::new(
            "demo-walk",
            "demo-user",
            "Morning walk",
            "Saw a heron by the canal.",
            now,
        );
        walk.tags = vec!["nature".into()];
        let standup = MemoryRecord::new(
            "demo-standup",
            "demo-user",
            "Standup",
            "Ship the parser today.",
            now,
        );

        for record in [walk, standup] {
            let receipt = ledger
                .submit(record)
                .await
                .unwrap_or_else(|err| fatal(&err.to_string()));
            println!(
                "{}",
                serde_json::to_string(&receipt).unwrap_or_else(|err| fatal(&err.to_string()))
            );
        }

        store
            .tamper("demo-standup", |record| {
                record.transcript = "Ship the parser next week.".into()
            })
            .await
            .unwrap_or_else(|err| fatal(&err.to_string()));

        for id in ["demo-walk", "demo-standup"] {
            let report = ledger
                .verify(id)
                .await
                .unwrap_or_else(|err| fatal(&err.to_string()));
            println!(
                "{id}: verified={} included={} consensus={}",
                report.verified, report.included, report.consensus.achieved
            );
        }
        if let Some(root) = ledger.root() {
            println!("root: {root} (leaves {}, depth {})", ledger.leaf_count(), ledger.tree_depth());
        }
    });
}
