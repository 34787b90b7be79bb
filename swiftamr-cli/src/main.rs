use mimalloc::MiMalloc;
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use swiftamr_core::{align_batch, write_tsv, KmerIndex};

/// Detect antimicrobial-resistance genes in short reads by k-mer
/// alignment against a reference database.
#[derive(Parser)]
#[command(name = "swiftamr", version)]
struct Cli {
    /// Reference FASTA of AMR gene sequences
    database: PathBuf,
    /// Reads to classify, FASTQ
    reads: PathBuf,
    /// Write the TSV report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let fasta = fs::read(&cli.database)
        .with_context(|| format!("reading reference {:?}", cli.database))?;
    eprintln!("Building k-mer index from {:?}...", cli.database);
    let index = KmerIndex::build_from_fasta(&fasta).context("building index")?;
    eprintln!("Index built: {} genes", index.num_genes());

    let fastq = fs::read(&cli.reads).with_context(|| format!("reading reads {:?}", cli.reads))?;
    eprintln!("Aligning reads from {:?}...", cli.reads);
    let batch = align_batch(&index, &fastq).context("aligning reads")?;
    eprintln!("Aligned {} reads", batch.len());

    let report = write_tsv(&index, &batch);
    match cli.output {
        Some(path) => {
            let file = File::create(&path).with_context(|| format!("creating {:?}", path))?;
            let mut writer = BufWriter::new(file);
            writer.write_all(report.as_bytes())?;
            writer.flush()?;
        }
        None => std::io::stdout().write_all(report.as_bytes())?,
    }
    Ok(())
}
